use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn agent_stack_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("agent-stack");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = r#"[stack]
name = "IntegrationStack"
region = "eu-west-1"

[collection]
name = "kb-collection"

[index]
name = "kb-index"
vector_field = "kb-vector"

[embedding]
model = "cohere.embed-english-v3"

[provider]
bind = "127.0.0.1:0"
timeout_secs = 5
max_retries = 1
"#;

    let config_path = config_dir.join("stack.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn command(config_path: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(agent_stack_binary());
    cmd.arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("AWS_ACCESS_KEY_ID")
        .env_remove("AWS_SECRET_ACCESS_KEY")
        .env_remove("AWS_SESSION_TOKEN")
        .env_remove("RUST_LOG")
        .env("AGENT_STACK_NO_COLOR", "1");
    cmd
}

fn run(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = command(config_path, args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run agent-stack binary: {}", e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_with_stdin(config_path: &Path, args: &[&str], input: &str) -> (String, String, bool) {
    let mut child = command(config_path, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn create_event(dimensions: &str) -> String {
    format!(
        r#"{{
  "RequestType": "Create",
  "RequestId": "req-1",
  "StackId": "IntegrationStack",
  "LogicalResourceId": "LambdaCreateIndexCustomResource",
  "ResourceType": "Custom::VectorIndex",
  "ResourceProperties": {{
    "Endpoint": "https://abc.eu-west-1.aoss.amazonaws.com",
    "IndexName": "kb-index",
    "FieldName": "kb-vector",
    "Dimensions": {},
    "Region": "eu-west-1"
  }}
}}"#,
        dimensions
    )
}

#[test]
fn test_synth_writes_template() {
    let (tmp, config_path) = setup_test_env();
    let out = tmp.path().join("out").join("stack.json");

    let (stdout, stderr, success) =
        run(&config_path, &["synth", "--out", out.to_str().unwrap()]);
    assert!(success, "synth failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("IntegrationStack"));

    let template: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    let resources = template["Resources"].as_object().unwrap();
    let gate = &resources["LambdaCreateIndexCustomResource"];
    assert_eq!(gate["Properties"]["IndexName"], "kb-index");
    assert_eq!(gate["Properties"]["FieldName"], "kb-vector");

    let kb_deps = resources["BedrockOpenSearchKnowledgeBase"]["DependsOn"]
        .as_array()
        .unwrap();
    assert!(kb_deps.iter().any(|d| d == "LambdaCreateIndexCustomResource"));
    assert_eq!(
        resources["BedrockAgentTest"]["Properties"]["Name"],
        "kb-collection"
    );
}

#[test]
fn test_synth_to_stdout_is_json() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run(&config_path, &["synth"]);
    assert!(success, "synth failed: {}", stderr);
    let template: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(template["Outputs"]["AgentID"].is_object());
}

#[test]
fn test_plan_orders_gate_before_knowledge_base() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run(&config_path, &["plan"]);
    assert!(success, "plan failed: {}", stderr);

    let gate = stdout.find("  LambdaCreateIndexCustomResource (").unwrap();
    let kb = stdout.find("  BedrockOpenSearchKnowledgeBase (").unwrap();
    let collection = stdout.find("  BedrockAgentTest (").unwrap();
    assert!(collection < gate);
    assert!(gate < kb);
    assert!(stdout.contains("Phase 1"));
}

#[test]
fn test_mapping_prints_index_body() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run(&config_path, &["mapping"]);
    assert!(success, "mapping failed: {}", stderr);

    let body: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(body["settings"]["index.knn"], "true");
    assert_eq!(body["mappings"]["properties"]["kb-vector"]["dimension"], 1024);
}

#[test]
fn test_handle_invalid_dimension_is_terminal() {
    let (tmp, config_path) = setup_test_env();
    let event = tmp.path().join("event.json");
    fs::write(&event, create_event("-1")).unwrap();

    let (stdout, stderr, success) = run(&config_path, &["handle", event.to_str().unwrap()]);
    assert!(success, "handle should exit 0 on FAILED: {}", stderr);

    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["Status"], "FAILED");
    assert!(response["Reason"]
        .as_str()
        .unwrap()
        .contains("invalid dimensionality"));
    assert_eq!(response["PhysicalResourceId"], "LambdaCreateIndexCustomResource");
}

#[test]
fn test_handle_string_dimensions_from_stdin() {
    let (_tmp, config_path) = setup_test_env();
    // No credentials in the environment: a valid Create cannot reach the
    // collection and fails as retryable.
    let (stdout, stderr, success) =
        run_with_stdin(&config_path, &["handle", "-"], &create_event("\"1024\""));
    assert!(success, "handle failed: {}", stderr);

    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["Status"], "FAILED");
    let reason = response["Reason"].as_str().unwrap();
    assert!(reason.contains("retryable"), "{}", reason);
    assert!(reason.contains("AWS_ACCESS_KEY_ID"), "{}", reason);
}

#[test]
fn test_handle_delete_retains_index() {
    let (_tmp, config_path) = setup_test_env();
    let event = r#"{
  "RequestType": "Delete",
  "RequestId": "req-2",
  "StackId": "IntegrationStack",
  "LogicalResourceId": "LambdaCreateIndexCustomResource",
  "PhysicalResourceId": "kb-index",
  "ResourceProperties": {}
}"#;
    let (stdout, stderr, success) = run_with_stdin(&config_path, &["handle"], event);
    assert!(success, "handle failed: {}", stderr);

    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["Status"], "SUCCESS");
    assert_eq!(response["PhysicalResourceId"], "kb-index");
}

#[test]
fn test_handle_malformed_event_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_with_stdin(&config_path, &["handle"], "{ not json");
    assert!(!success);
    assert!(stderr.contains("Failed to parse custom resource event"), "{}", stderr);
}

#[test]
fn test_bootstrap_dry_run() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run(&config_path, &["bootstrap", "--dry-run"]);
    assert!(success, "bootstrap failed: {}", stderr);
    assert!(stdout.contains("Index 'kb-index' created after 1 attempt(s)."), "{}", stdout);
    assert!(stdout.contains("\"Status\": \"SUCCESS\""), "{}", stdout);
}

#[test]
fn test_bootstrap_dry_run_creates_the_printed_mapping() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("stack.toml");
    fs::write(
        &config_path,
        r#"[stack]
name = "MethodStack"

[index]
name = "kb-index"
vector_field = "kb-vector"
engine = "nmslib"
space_type = "cosinesimil"
ef_construction = 256
m = 32
ef_search = 128
"#,
    )
    .unwrap();

    let (mapping, stderr, success) = run(&config_path, &["mapping"]);
    assert!(success, "mapping failed: {}", stderr);
    let printed: serde_json::Value = serde_json::from_str(&mapping).unwrap();
    assert_eq!(
        printed["mappings"]["properties"]["kb-vector"]["method"]["engine"],
        "nmslib"
    );

    let (stdout, stderr, success) = run(&config_path, &["bootstrap", "--dry-run"]);
    assert!(success, "bootstrap failed: {}", stderr);
    assert!(
        stdout.contains(mapping.trim_end()),
        "created body differs from `mapping` output:\n{}",
        stdout
    );
}

#[test]
fn test_bootstrap_requires_endpoint() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run(&config_path, &["bootstrap"]);
    assert!(!success);
    assert!(stderr.contains("no collection endpoint"), "{}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("stack.toml");
    fs::write(
        &config_path,
        "[stack]\nname = \"bad\"\n[index]\ndimensions = 1536\n",
    )
    .unwrap();

    let (_, stderr, success) = run(&config_path, &["plan"]);
    assert!(!success);
    assert!(stderr.contains("dimensionality"), "{}", stderr);
}

#[test]
fn test_missing_config_file() {
    let (_, stderr, success) = run(Path::new("/nonexistent/stack.toml"), &["synth"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_llm_does_not_need_config() {
    let (stdout, stderr, success) = run(
        Path::new("/nonexistent/stack.toml"),
        &["llm", "aws-redrock", "anthropic.claude-3-sonnet-20240229-v1:0"],
    );
    assert!(success, "llm failed: {}", stderr);
    let spec: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(spec["provider"], "aws-bedrock");
    assert_eq!(spec["temperature"], 0.0);
}

#[test]
fn test_extract_answer_from_stdin() {
    let (stdout, _, success) = run_with_stdin(
        Path::new("/nonexistent/stack.toml"),
        &["extract", "answer"],
        "<thinking>hmm</thinking><ANSWER>t3.micro</ANSWER>",
    );
    assert!(success);
    assert_eq!(stdout.trim(), "t3.micro");
}
