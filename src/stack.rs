//! The agent stack as a resource graph.
//!
//! [`build_stack`] declares every resource of the deployment and the edges
//! between them, and the result renders to a provisioning template
//! (`agent-stack synth`) or a phased plan (`agent-stack plan`).
//!
//! # Resources
//!
//! | Logical id | Type | Depends on |
//! |------------|------|------------|
//! | `S3Key` | `AWS::KMS::Key` | |
//! | `AgentDataSource` | `AWS::S3::Bucket` | `S3Key` |
//! | `KnowledgeBaseDocumentDeployment` | `Custom::CDKBucketDeployment` | bucket |
//! | `BedrockAgentRole` | `AWS::IAM::Role` | |
//! | `CreateIndexExecutionRole` | `AWS::IAM::Role` | |
//! | `EncryptionPolicy`, `NetworkPolicy`, `DataPolicy` | `AWS::OpenSearchServerless::*Policy` | roles |
//! | `BedrockAgentTest` | `AWS::OpenSearchServerless::Collection` | the three policies |
//! | `CreateOpenSearchIndex` | `AWS::Lambda::Function` | collection |
//! | `LambdaCreateIndexCustomResource` | `Custom::VectorIndex` | collection, provider |
//! | `BedrockOpenSearchKnowledgeBase` | `AWS::Bedrock::KnowledgeBase` | the gate |
//! | `BedrockKnowledgeBaseDataSource` | `AWS::Bedrock::DataSource` | knowledge base, bucket |
//! | `TestBedrockAgent` | `AWS::Bedrock::Agent` | knowledge base |
//!
//! The knowledge base must never be created before the index exists, so it
//! depends on the gate custom resource, which in turn depends on the
//! collection.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use agent_stack_core::graph::{
    get_att, reference, sub, NodeId, ResourceDeclaration, ResourceGraph,
};

use crate::config::Config;
use crate::console::{print_msg, MsgColor};

/// Logical ids of the declared resources.
pub mod ids {
    pub const KMS_KEY: &str = "S3Key";
    pub const KMS_KEY_ALIAS: &str = "S3KeyAlias";
    pub const BUCKET: &str = "AgentDataSource";
    pub const BUCKET_POLICY: &str = "AgentDataSourcePolicy";
    pub const DEPLOYMENT: &str = "KnowledgeBaseDocumentDeployment";
    pub const AGENT_ROLE: &str = "BedrockAgentRole";
    pub const AGENT_ROLE_POLICY: &str = "BedrockAgentRoleDefaultPolicy";
    pub const INDEX_ROLE: &str = "CreateIndexExecutionRole";
    pub const INDEX_ROLE_POLICY: &str = "CreateIndexExecutionRoleDefaultPolicy";
    pub const ENCRYPTION_POLICY: &str = "EncryptionPolicy";
    pub const NETWORK_POLICY: &str = "NetworkPolicy";
    pub const DATA_POLICY: &str = "DataPolicy";
    pub const COLLECTION: &str = "BedrockAgentTest";
    pub const INDEX_FUNCTION: &str = "CreateOpenSearchIndex";
    pub const PROVIDER: &str = "LambdaCreateIndexCustomProvider";
    pub const INDEX_GATE: &str = "LambdaCreateIndexCustomResource";
    pub const KNOWLEDGE_BASE: &str = "BedrockOpenSearchKnowledgeBase";
    pub const DATA_SOURCE: &str = "BedrockKnowledgeBaseDataSource";
    pub const AGENT: &str = "TestBedrockAgent";
}

/// Resource type of the index gate custom resource.
pub const GATE_RESOURCE_TYPE: &str = "Custom::VectorIndex";

/// A named, fully declared stack.
#[derive(Debug, Clone)]
pub struct Stack {
    pub name: String,
    pub description: String,
    pub graph: ResourceGraph,
}

impl Stack {
    /// Render the provisioning template.
    pub fn template(&self) -> Result<Value> {
        let template = self
            .graph
            .render_template(&self.description)
            .with_context(|| format!("stack '{}' cannot be ordered", self.name))?;
        Ok(template)
    }

    /// Declarations grouped into creation waves.
    pub fn plan(&self) -> Result<Vec<Vec<&ResourceDeclaration>>> {
        let phases = self.graph.phases()?;
        Ok(phases
            .into_iter()
            .map(|wave| wave.into_iter().filter_map(|id| self.graph.get(id)).collect())
            .collect())
    }

    pub fn node(&self, logical_id: &str) -> Option<NodeId> {
        self.graph.find(logical_id)
    }
}

/// Declare the whole stack from configuration.
pub fn build_stack(config: &Config) -> Result<Stack> {
    let mut g = ResourceGraph::new();
    let mapping = config.index_mapping();
    let collection_name = config.collection.name.as_str();
    let prefix = config.data_source.prefix.trim_end_matches('/');

    // ---- S3 data source ----

    g.add(ResourceDeclaration::new(
        ids::KMS_KEY,
        "AWS::KMS::Key",
        json!({
            "EnableKeyRotation": true,
            "PendingWindowInDays": 7,
            "KeyPolicy": {
                "Version": "2012-10-17",
                "Statement": [
                    {
                        "Effect": "Allow",
                        "Principal": { "AWS": sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:root") },
                        "Action": "kms:*",
                        "Resource": "*"
                    },
                    {
                        "Effect": "Allow",
                        "Principal": { "AWS": "*" },
                        "Action": ["kms:Decrypt", "kms:Encrypt", "kms:ReEncrypt*", "kms:GenerateDataKey*"],
                        "Resource": "*",
                        "Condition": {
                            "StringEquals": {
                                "kms:CallerAccount": reference("AWS::AccountId"),
                                "kms:ViaService": sub("s3.${AWS::Region}.amazonaws.com")
                            }
                        }
                    },
                    {
                        "Effect": "Allow",
                        "Principal": { "Service": sub("logs.${AWS::Region}.amazonaws.com") },
                        "Action": ["kms:Decrypt", "kms:Encrypt", "kms:ReEncrypt*", "kms:GenerateDataKey*"],
                        "Resource": "*"
                    }
                ]
            }
        }),
    ))?;

    g.add(ResourceDeclaration::new(
        ids::KMS_KEY_ALIAS,
        "AWS::KMS::Alias",
        json!({
            "AliasName": sub("alias/${AWS::StackName}/s3_key"),
            "TargetKeyId": get_att(ids::KMS_KEY, "Arn"),
        }),
    ))?;
    g.depend_on(ids::KMS_KEY_ALIAS, ids::KMS_KEY)?;

    g.add(ResourceDeclaration::new(
        ids::BUCKET,
        "AWS::S3::Bucket",
        json!({
            "BucketName": config.data_source.bucket,
            "BucketEncryption": {
                "ServerSideEncryptionConfiguration": [{
                    "ServerSideEncryptionByDefault": {
                        "SSEAlgorithm": "aws:kms",
                        "KMSMasterKeyID": get_att(ids::KMS_KEY, "Arn"),
                    }
                }]
            },
            "PublicAccessBlockConfiguration": {
                "BlockPublicAcls": true,
                "BlockPublicPolicy": true,
                "IgnorePublicAcls": true,
                "RestrictPublicBuckets": true,
            },
            "VersioningConfiguration": { "Status": "Suspended" },
        }),
    ))?;
    g.depend_on(ids::BUCKET, ids::KMS_KEY)?;

    g.add(ResourceDeclaration::new(
        ids::BUCKET_POLICY,
        "AWS::S3::BucketPolicy",
        json!({
            "Bucket": reference(ids::BUCKET),
            "PolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Deny",
                    "Principal": { "AWS": "*" },
                    "Action": "s3:*",
                    "Resource": [
                        get_att(ids::BUCKET, "Arn"),
                        { "Fn::Join": ["", [get_att(ids::BUCKET, "Arn"), "/*"]] },
                    ],
                    "Condition": { "Bool": { "aws:SecureTransport": "false" } },
                }]
            }
        }),
    ))?;
    g.depend_on(ids::BUCKET_POLICY, ids::BUCKET)?;

    let asset_key = config
        .data_source
        .asset
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    g.add(ResourceDeclaration::new(
        ids::DEPLOYMENT,
        "Custom::CDKBucketDeployment",
        json!({
            "SourceAsset": config.data_source.asset.display().to_string(),
            "SourceObjectKeys": [asset_key],
            "DestinationBucketName": reference(ids::BUCKET),
            "DestinationBucketKeyPrefix": format!("{}/", prefix),
            "RetainOnDelete": false,
        }),
    ))?;
    g.depend_on(ids::DEPLOYMENT, ids::BUCKET)?;

    // ---- IAM ----

    g.add(ResourceDeclaration::new(
        ids::AGENT_ROLE,
        "AWS::IAM::Role",
        json!({
            "RoleName": config.agent.role_name,
            "AssumeRolePolicyDocument": assume_role("bedrock.amazonaws.com"),
        }),
    ))?;

    g.add(ResourceDeclaration::new(
        ids::INDEX_ROLE,
        "AWS::IAM::Role",
        json!({
            "Description": "Role for OpenSearch access",
            "AssumeRolePolicyDocument": assume_role("lambda.amazonaws.com"),
            "ManagedPolicyArns": [
                sub("arn:${AWS::Partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole")
            ],
        }),
    ))?;

    // ---- Collection and its security policies ----

    let collection_resource = vec![format!("collection/{}", collection_name)];

    g.add(ResourceDeclaration::new(
        ids::ENCRYPTION_POLICY,
        "AWS::OpenSearchServerless::SecurityPolicy",
        json!({
            "Name": format!("{}-encryption-policy", policy_prefix(collection_name)),
            "Type": "encryption",
            "Description": "Encryption policy for Bedrock collection.",
            "Policy": json!({
                "Rules": [{ "ResourceType": "collection", "Resource": collection_resource }],
                "AWSOwnedKey": true,
            }).to_string(),
        }),
    ))?;

    g.add(ResourceDeclaration::new(
        ids::NETWORK_POLICY,
        "AWS::OpenSearchServerless::SecurityPolicy",
        json!({
            "Name": format!("{}-network-policy", policy_prefix(collection_name)),
            "Type": "network",
            "Description": "Network policy for Bedrock collection",
            "Policy": json!([{
                "Rules": [
                    { "ResourceType": "collection", "Resource": collection_resource },
                    { "ResourceType": "dashboard", "Resource": collection_resource },
                ],
                "AllowFromPublic": true,
            }]).to_string(),
        }),
    ))?;

    // The data policy names both roles as principals. The policy document is
    // a JSON string, so the role ARNs are spliced in with Fn::Sub.
    let data_policy = json!([{
        "Description": "Access for cfn user",
        "Rules": [
            { "ResourceType": "index", "Resource": ["index/*/*"], "Permission": ["aoss:*"] },
            { "ResourceType": "collection", "Resource": collection_resource, "Permission": ["aoss:*"] },
        ],
        "Principal": [
            format!("${{{}.Arn}}", ids::AGENT_ROLE),
            format!("${{{}.Arn}}", ids::INDEX_ROLE),
        ],
    }])
    .to_string();
    g.add(ResourceDeclaration::new(
        ids::DATA_POLICY,
        "AWS::OpenSearchServerless::AccessPolicy",
        json!({
            "Name": format!("{}-data-policy", policy_prefix(collection_name)),
            "Type": "data",
            "Description": "Data policy for Bedrock collection.",
            "Policy": sub(&data_policy),
        }),
    ))?;
    g.depend_on(ids::DATA_POLICY, ids::AGENT_ROLE)?;
    g.depend_on(ids::DATA_POLICY, ids::INDEX_ROLE)?;

    g.add(ResourceDeclaration::new(
        ids::COLLECTION,
        "AWS::OpenSearchServerless::Collection",
        json!({
            "Name": collection_name,
            "Description": "Test Bedrock Agent",
            "Type": "VECTORSEARCH",
        }),
    ))?;
    g.depend_on(ids::COLLECTION, ids::NETWORK_POLICY)?;
    g.depend_on(ids::COLLECTION, ids::ENCRYPTION_POLICY)?;
    g.depend_on(ids::COLLECTION, ids::DATA_POLICY)?;

    // ---- Role policies that reference the collection ----

    let collection_access = json!({
        "Effect": "Allow",
        "Action": ["aoss:APIAccessAll"],
        "Resource": [sub(&format!(
            "arn:${{AWS::Partition}}:aoss:${{AWS::Region}}:${{AWS::AccountId}}:collection/${{{}.Id}}",
            ids::COLLECTION
        ))],
    });
    let bucket_condition = json!({ "StringEquals": { "aws:ResourceAccount": reference("AWS::AccountId") } });

    g.add(ResourceDeclaration::new(
        ids::AGENT_ROLE_POLICY,
        "AWS::IAM::Policy",
        json!({
            "PolicyName": format!("{}DefaultPolicy", ids::AGENT_ROLE),
            "Roles": [reference(ids::AGENT_ROLE)],
            "PolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [
                    {
                        "Effect": "Allow",
                        "Action": ["bedrock:InvokeModel"],
                        "Resource": [sub("arn:aws:bedrock:${AWS::Region}::foundation-model/*")],
                    },
                    {
                        "Effect": "Allow",
                        "Action": ["s3:GetObject", "s3:ListBucket"],
                        "Resource": [
                            sub(&format!("arn:aws:s3:::${{{}}}", ids::BUCKET)),
                            sub(&format!("arn:aws:s3:::${{{}}}/*", ids::BUCKET)),
                        ],
                        "Condition": bucket_condition,
                    },
                    {
                        "Effect": "Allow",
                        "Action": ["bedrock:Retrieve", "bedrock:RetrieveAndGenerate"],
                        "Resource": [sub("arn:aws:bedrock:${AWS::Region}:${AWS::AccountId}:knowledge-base/*")],
                        "Condition": bucket_condition,
                    },
                    collection_access,
                ]
            }
        }),
    ))?;
    g.depend_on(ids::AGENT_ROLE_POLICY, ids::AGENT_ROLE)?;
    g.depend_on(ids::AGENT_ROLE_POLICY, ids::BUCKET)?;
    g.depend_on(ids::AGENT_ROLE_POLICY, ids::COLLECTION)?;

    g.add(ResourceDeclaration::new(
        ids::INDEX_ROLE_POLICY,
        "AWS::IAM::Policy",
        json!({
            "PolicyName": format!("{}DefaultPolicy", ids::INDEX_ROLE),
            "Roles": [reference(ids::INDEX_ROLE)],
            "PolicyDocument": { "Version": "2012-10-17", "Statement": [collection_access] },
        }),
    ))?;
    g.depend_on(ids::INDEX_ROLE_POLICY, ids::INDEX_ROLE)?;
    g.depend_on(ids::INDEX_ROLE_POLICY, ids::COLLECTION)?;

    // ---- Index gate ----

    g.add(ResourceDeclaration::new(
        ids::INDEX_FUNCTION,
        "AWS::Lambda::Function",
        json!({
            "FunctionName": sub("${AWS::StackName}-create-index"),
            "Runtime": "provided.al2023",
            "Handler": "bootstrap",
            "Architectures": ["arm64"],
            "Role": get_att(ids::INDEX_ROLE, "Arn"),
            "Timeout": config.provider.timeout_secs,
            "Environment": {
                "Variables": {
                    "REGION_NAME": reference("AWS::Region"),
                    "COLLECTION_HOST": get_att(ids::COLLECTION, "CollectionEndpoint"),
                    "VECTOR_INDEX_NAME": mapping.index_name,
                    "VECTOR_FIELD_NAME": mapping.vector_field,
                }
            },
        }),
    ))?;
    g.depend_on(ids::INDEX_FUNCTION, ids::INDEX_ROLE)?;
    g.depend_on(ids::INDEX_FUNCTION, ids::INDEX_ROLE_POLICY)?;
    g.depend_on(ids::INDEX_FUNCTION, ids::COLLECTION)?;

    g.add(ResourceDeclaration::new(
        ids::PROVIDER,
        "AWS::Lambda::Function",
        json!({
            "Description": "Custom resource provider for the vector index gate",
            "Runtime": "provided.al2023",
            "Handler": "framework.onEvent",
            "Timeout": config.provider.timeout_secs,
            "Environment": {
                "Variables": {
                    "USER_ON_EVENT_FUNCTION_ARN": get_att(ids::INDEX_FUNCTION, "Arn"),
                }
            },
        }),
    ))?;
    g.depend_on(ids::PROVIDER, ids::INDEX_FUNCTION)?;

    g.add(ResourceDeclaration::new(
        ids::INDEX_GATE,
        GATE_RESOURCE_TYPE,
        json!({
            "ServiceToken": get_att(ids::PROVIDER, "Arn"),
            "Endpoint": get_att(ids::COLLECTION, "CollectionEndpoint"),
            "IndexName": mapping.index_name,
            "FieldName": mapping.vector_field,
            "Dimensions": mapping.dimensions,
            "Region": reference("AWS::Region"),
            "TextField": mapping.text_field,
            "MetadataField": mapping.metadata_field,
            "ExpectedDimensions": config.embedding.resolved_dims(),
            "Engine": mapping.engine.as_str(),
            "SpaceType": mapping.space_type.as_str(),
            "EfConstruction": mapping.hnsw.ef_construction,
            "M": mapping.hnsw.m,
            "EfSearch": mapping.hnsw.ef_search,
        }),
    ))?;
    g.depend_on(ids::INDEX_GATE, ids::COLLECTION)?;
    g.depend_on(ids::INDEX_GATE, ids::PROVIDER)?;

    // ---- Knowledge base, data source, agent ----

    g.add(ResourceDeclaration::new(
        ids::KNOWLEDGE_BASE,
        "AWS::Bedrock::KnowledgeBase",
        json!({
            "Name": config.agent.knowledge_base_name,
            "Description": config.agent.knowledge_base_description,
            "RoleArn": get_att(ids::AGENT_ROLE, "Arn"),
            "KnowledgeBaseConfiguration": {
                "Type": "VECTOR",
                "VectorKnowledgeBaseConfiguration": {
                    "EmbeddingModelArn": sub(&format!(
                        "arn:${{AWS::Partition}}:bedrock:${{AWS::Region}}::foundation-model/{}",
                        config.embedding.model
                    )),
                }
            },
            "StorageConfiguration": {
                "Type": "OPENSEARCH_SERVERLESS",
                "OpensearchServerlessConfiguration": {
                    "CollectionArn": get_att(ids::COLLECTION, "Arn"),
                    "VectorIndexName": mapping.index_name,
                    "FieldMapping": {
                        "VectorField": mapping.vector_field,
                        "TextField": mapping.text_field,
                        "MetadataField": mapping.metadata_field,
                    }
                }
            },
        }),
    ))?;
    g.depend_on(ids::KNOWLEDGE_BASE, ids::INDEX_GATE)?;
    g.depend_on(ids::KNOWLEDGE_BASE, ids::COLLECTION)?;
    g.depend_on(ids::KNOWLEDGE_BASE, ids::AGENT_ROLE)?;
    g.depend_on(ids::KNOWLEDGE_BASE, ids::AGENT_ROLE_POLICY)?;

    g.add(
        ResourceDeclaration::new(
            ids::DATA_SOURCE,
            "AWS::Bedrock::DataSource",
            json!({
                "Name": "BedrockKnowledgeBaseSource",
                "KnowledgeBaseId": get_att(ids::KNOWLEDGE_BASE, "KnowledgeBaseId"),
                "DataDeletionPolicy": "RETAIN",
                "DataSourceConfiguration": {
                    "Type": "S3",
                    "S3Configuration": {
                        "BucketArn": sub(&format!("arn:aws:s3:::${{{}}}", ids::BUCKET)),
                        "BucketOwnerAccountId": reference("AWS::AccountId"),
                        "InclusionPrefixes": [format!("{}/", prefix)],
                    }
                },
            }),
        )
        .retain(),
    )?;
    g.depend_on(ids::DATA_SOURCE, ids::KNOWLEDGE_BASE)?;
    g.depend_on(ids::DATA_SOURCE, ids::BUCKET)?;

    g.add(ResourceDeclaration::new(
        ids::AGENT,
        "AWS::Bedrock::Agent",
        json!({
            "AgentName": config.agent.name,
            "AgentResourceRoleArn": get_att(ids::AGENT_ROLE, "Arn"),
            "Description": "Bedrock Test Agent",
            "FoundationModel": config.agent.foundation_model,
            "IdleSessionTTLInSeconds": config.agent.idle_session_ttl_secs,
            "Instruction": config.agent.instruction,
            "KnowledgeBases": [{
                "Description": config.agent.knowledge_base_description,
                "KnowledgeBaseId": get_att(ids::KNOWLEDGE_BASE, "KnowledgeBaseId"),
            }],
        }),
    ))?;
    g.depend_on(ids::AGENT, ids::AGENT_ROLE)?;
    g.depend_on(ids::AGENT, ids::KNOWLEDGE_BASE)?;

    // ---- Outputs ----

    g.add_output("AgentID", get_att(ids::AGENT, "AgentId"), None);
    g.add_output("DataSourceBucketName", reference(ids::BUCKET), None);
    g.add_output(
        "VectorIndexName",
        get_att(ids::INDEX_GATE, "IndexName"),
        Some("Vector index created by the index gate"),
    );

    Ok(Stack {
        name: config.stack.name.clone(),
        description: format!("{} (agent-stack {})", config.stack.name, env!("CARGO_PKG_VERSION")),
        graph: g,
    })
}

/// `agent-stack synth`: write the template to `out`, or stdout.
pub fn run_synth(config: &Config, out: Option<&Path>) -> Result<()> {
    let stack = build_stack(config)?;
    let json = serde_json::to_string_pretty(&stack.template()?)?;

    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, format!("{}\n", json))
                .with_context(|| format!("Failed to write template: {}", path.display()))?;
            println!(
                "Wrote {} resources for stack '{}' to {}",
                stack.graph.len(),
                stack.name,
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// `agent-stack plan`: print the creation waves.
pub fn run_plan(config: &Config) -> Result<()> {
    let stack = build_stack(config)?;
    let plan = stack.plan()?;
    for (i, wave) in plan.iter().enumerate() {
        let lines: Vec<String> = wave
            .iter()
            .map(|d| {
                let deps: Vec<&str> = stack
                    .node(&d.logical_id)
                    .map(|id| stack.graph.dependencies(id))
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|dep| stack.graph.get(dep))
                    .map(|dep| dep.logical_id.as_str())
                    .collect();
                if deps.is_empty() {
                    format!("  {} ({})", d.logical_id, d.resource_type)
                } else {
                    format!("  {} ({}) <- {}", d.logical_id, d.resource_type, deps.join(", "))
                }
            })
            .collect();
        print_msg(
            &lines.join("\n"),
            Some(&format!(" Phase {} ", i + 1)),
            MsgColor::Cyan,
            false,
        );
    }
    println!(
        "{} resources in {} phases for stack '{}'",
        stack.graph.len(),
        plan.len(),
        stack.name
    );
    Ok(())
}

/// `agent-stack mapping`: print the index body the gate will send.
pub fn run_mapping(config: &Config) -> Result<()> {
    let mapping = config.index_mapping();
    mapping
        .validate(config.embedding.resolved_dims())
        .map_err(|e| anyhow::anyhow!("index: {}", e))?;
    println!("{}", serde_json::to_string_pretty(&mapping.to_index_body())?);
    Ok(())
}

fn assume_role(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }]
    })
}

/// Security policy names are capped at 32 characters.
fn policy_prefix(collection_name: &str) -> String {
    let prefix: String = collection_name.chars().take(13).collect();
    prefix.trim_end_matches('-').to_string()
}
