//! Console message formatting.
//!
//! [`print_msg`] prints a message either as a titled banner or inside a
//! horizontal-rule box. Color is applied only when stdout is a terminal
//! and `AGENT_STACK_NO_COLOR` is not set to a true value.

use colored::{Color, Colorize};

use agent_stack_core::text::parse_flag;

const BANNER_RULE: usize = 20;
const FOOTER_RULE: usize = 50;
const BOX_WIDTH: usize = 70;

/// Message colors. Unknown names fall back to blue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgColor {
    #[default]
    Blue,
    Green,
    Cyan,
    Red,
}

impl MsgColor {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "green" => MsgColor::Green,
            "cyan" => MsgColor::Cyan,
            "red" => MsgColor::Red,
            _ => MsgColor::Blue,
        }
    }

    fn color(&self) -> Color {
        match self {
            MsgColor::Blue => Color::BrightBlue,
            MsgColor::Green => Color::BrightGreen,
            MsgColor::Cyan => Color::BrightCyan,
            MsgColor::Red => Color::BrightRed,
        }
    }
}

/// Whether stdout should receive ANSI colors.
pub fn color_enabled() -> bool {
    let disabled = std::env::var("AGENT_STACK_NO_COLOR")
        .map(|v| parse_flag(&v))
        .unwrap_or(false);
    !disabled && atty::is(atty::Stream::Stdout)
}

/// Render a message. With `boxed`, the message sits between two rules and
/// the title is set into the top rule; otherwise a title produces a
/// `====title====` banner and a closing rule.
pub fn format_msg(msg: &str, title: Option<&str>, color: MsgColor, boxed: bool, use_color: bool) -> String {
    let body = if use_color {
        msg.color(color.color()).to_string()
    } else {
        msg.to_string()
    };

    if boxed {
        let top = match title {
            Some(t) => {
                let head = format!("── {} ", t);
                let used = head.chars().count();
                format!("{}{}", head, "─".repeat(BOX_WIDTH.saturating_sub(used)))
            }
            None => "─".repeat(BOX_WIDTH),
        };
        let bottom = "─".repeat(BOX_WIDTH);
        let (top, bottom) = if use_color {
            (
                top.color(color.color()).to_string(),
                bottom.color(color.color()).to_string(),
            )
        } else {
            (top, bottom)
        };
        return format!("{}\n{}\n{}", top, body, bottom);
    }

    match title {
        Some(t) => format!(
            "\n{}{}{}\n{}\n{}\n",
            "=".repeat(BANNER_RULE),
            t,
            "=".repeat(BANNER_RULE),
            body,
            "=".repeat(FOOTER_RULE)
        ),
        None => body,
    }
}

pub fn print_msg(msg: &str, title: Option<&str>, color: MsgColor, boxed: bool) {
    println!("{}", format_msg(msg, title, color, boxed, color_enabled()));
}
