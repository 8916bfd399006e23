/// Output formatting: terminal table and JSON.
use pairank_core::{CandidateItem, RankedItem};
use serde::Serialize;

use crate::bail;

#[derive(Serialize)]
struct JsonRankedItem<'a> {
    position: u32,
    id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cover: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    user: &'a str,
    items: Vec<JsonRankedItem<'a>>,
}

/// Render the ranking as a terminal table. `items[i]` is the metadata for
/// `ranked[i]`.
pub fn render_table(ranked: &[RankedItem], items: &[CandidateItem]) -> String {
    if ranked.is_empty() {
        return "No ranked items yet. Add one with `pairank add --title ...`\n".to_string();
    }

    let title_width = items.iter().map(|c| c.title.len()).max().unwrap_or(5).max(5); // at least "Title"
    let mut out = String::new();
    out.push_str(&format!("   # | {:<title_width$} | Id\n", "Title"));
    out.push_str(&format!("-----|-{}-|------\n", "-".repeat(title_width)));
    for (r, item) in ranked.iter().zip(items) {
        out.push_str(&format!("{:>4} | {:<title_width$} | {}\n", r.position, item.title, r.item_id));
    }
    out.push_str(&format!("\n{} items ranked\n", ranked.len()));
    out
}

pub fn print_table(ranked: &[RankedItem], items: &[CandidateItem]) {
    print!("{}", render_table(ranked, items));
}

pub fn render_json(user: &str, ranked: &[RankedItem], items: &[CandidateItem]) -> String {
    let output = JsonOutput {
        user,
        items: ranked
            .iter()
            .zip(items)
            .map(|(r, item)| JsonRankedItem {
                position: r.position,
                id: r.item_id.as_str(),
                title: &item.title,
                cover: item.cover.as_deref(),
                external_id: item.external_id.as_deref(),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&output).unwrap_or_else(|e| bail(format!("Failed to encode JSON: {e}")))
}

pub fn print_json(user: &str, ranked: &[RankedItem], items: &[CandidateItem]) {
    println!("{}", render_json(user, ranked, items));
}
