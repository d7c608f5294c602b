use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::payload::ContentBlock;
use crate::session::{ConversationTurn, Role};

pub const USER_LABEL: &str = "You";
pub const ASSISTANT_LABEL: &str = "Claude";

/// Plain-text transcript, one `Label: text` entry per turn.
pub fn render_text(turns: &[ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        match turn.role() {
            Role::User => {
                out.push_str(&format!("{USER_LABEL}: {}", turn.text()));
                if let Some(image) = turn.image() {
                    out.push_str(&format!("  [{}]", image.name));
                }
            }
            Role::Assistant => out.push_str(&format!("{ASSISTANT_LABEL}: {}", turn.text())),
        }
        out.push('\n');
    }
    out
}

pub fn render_html(title: &str, turns: &[ConversationTurn]) -> String {
    let mut rows = String::new();
    let mut last_image: Option<String> = None;
    for turn in turns {
        let (class, label) = match turn.role() {
            Role::User => ("user", USER_LABEL),
            Role::Assistant => ("assistant", ASSISTANT_LABEL),
        };
        // The image is shown once, above the first question asked about it.
        if let Some(image) = turn.image() {
            if last_image.as_deref() != Some(image.name.as_str()) {
                if let Some(src) = inline_image_src(turn) {
                    rows.push_str(&format!(
                        "<div class='image'><img src='{src}' alt='{alt}'><div class='caption'>{alt}</div></div>",
                        src = escape_html(&src),
                        alt = escape_html(&image.name),
                    ));
                }
                last_image = Some(image.name.clone());
            }
        }
        rows.push_str(&format!(
            "<div class='turn {class}'><div class='who'>{label}</div><div class='text'>{text}</div><div class='ts'>{ts}</div></div>",
            text = escape_html(turn.text()),
            ts = escape_html(turn.created_at()),
        ));
    }

    format!(
        "<!doctype html>\n<html>\n<head>\n  <meta charset='utf-8'>\n  <title>{title}</title>\n  <style>\n    body {{ font-family: Arial, sans-serif; background: #f6f6f6; margin: 0; padding: 20px; }}\n    .chat {{ max-width: 760px; margin: 0 auto; }}\n    .image {{ text-align: center; margin: 16px 0; }}\n    .image img {{ max-width: 100%; max-height: 360px; border-radius: 10px; }}\n    .caption {{ font-size: 12px; color: #666; }}\n    .turn {{ background: white; border-radius: 10px; padding: 10px 14px; margin: 10px 0; box-shadow: 0 2px 8px rgba(0,0,0,0.08); }}\n    .turn.user {{ border-left: 4px solid #0066cc; }}\n    .turn.assistant {{ border-left: 4px solid #cc7a00; }}\n    .who {{ font-weight: bold; font-size: 12px; color: #444; }}\n    .text {{ white-space: pre-wrap; margin: 6px 0; }}\n    .ts {{ font-size: 11px; color: #999; }}\n  </style>\n</head>\n<body>\n  <h1>{title}</h1>\n  <div class='chat'>\n    {rows}\n  </div>\n</body>\n</html>\n",
        title = escape_html(title),
    )
}

pub fn write_html(out_path: &Path, title: &str, turns: &[ConversationTurn]) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out_path, render_html(title, turns))
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    Ok(())
}

fn inline_image_src(turn: &ConversationTurn) -> Option<String> {
    turn.content_blocks().into_iter().find_map(|block| match block {
        ContentBlock::Image { source } => Some(format!(
            "data:{};base64,{}",
            source.media_type.as_mime(),
            source.data
        )),
        ContentBlock::Text { .. } => None,
    })
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}
