//! Managed-section rendering
//!
//! Rules render into a sentinel-delimited block inside the managed file.
//! Rendering is a pure function of the rule records, the categories and the
//! wall-clock used for effective-window filtering, so the same inputs always
//! produce the same bytes.
//!
//! Layout:
//!
//! ```text
//! <!-- MANAGED BY EDICTFLOW - DO NOT EDIT -->
//!
//! ## Security
//!
//! [Enterprise] **No secrets**
//! Never commit credentials.
//!
//! <!-- END EDICTFLOW -->
//! ```
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use edictflow_core::render::{render_managed_section, merge_with_existing, OPEN_SENTINEL};
//!
//! // No rules, nothing to render
//! let empty = render_managed_section(&[], &[], Utc::now());
//! assert!(empty.is_empty());
//! assert_eq!(merge_with_existing("# Notes\n", &empty), "# Notes\n");
//! assert!(!merge_with_existing("# Notes\n", "x").contains(OPEN_SENTINEL));
//! ```

mod merge;

pub use merge::{extract_manual_content, is_tampered, managed_section, merge_with_existing};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{Category, TargetLayer};
use crate::protocol::RuleRecord;

/// First line of every managed section
pub const OPEN_SENTINEL: &str = "<!-- MANAGED BY EDICTFLOW - DO NOT EDIT -->";

/// Last line of every managed section
pub const CLOSE_SENTINEL: &str = "<!-- END EDICTFLOW -->";

/// Header used for rules without a known category
pub const UNCATEGORIZED_HEADER: &str = "Uncategorized";

/// Uppercases the first byte only
pub fn title_case(s: &str) -> String {
    let mut out = s.to_string();
    if let Some(first) = out.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    out
}

fn layer_label(layer: TargetLayer) -> String {
    title_case(layer.as_str())
}

/// Header line plus body of a single rule
///
/// The managed section is a concatenation of these blocks (with category
/// headers between them), so agents use this to work out which rule an edit
/// touched.
pub fn render_rule_block(rule: &RuleRecord) -> String {
    let mut block = format!("[{}] **{}**", layer_label(rule.target_layer), rule.name);
    if rule.overridable {
        block.push_str(" (overridable)");
    }
    block.push('\n');
    block.push_str(rule.body.trim_end_matches(['\n', '\r']));
    block
}

/// Render the managed section for `rules`
///
/// Rules outside their effective window at `now` are dropped. Rules group by
/// category (display order, then name; uncategorized last) and sort by
/// descending priority weight within a group. An empty result renders as
/// the empty string.
pub fn render_managed_section(
    rules: &[RuleRecord],
    categories: &[Category],
    now: DateTime<Utc>,
) -> String {
    let live: Vec<&RuleRecord> = rules.iter().filter(|r| r.is_effective_at(now)).collect();
    if live.is_empty() {
        return String::new();
    }

    let known: HashMap<&str, &Category> = categories.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut groups: HashMap<Option<&str>, Vec<&RuleRecord>> = HashMap::new();
    for rule in live {
        let key = rule
            .category_id
            .as_deref()
            .filter(|id| known.contains_key(id));
        groups.entry(key).or_default().push(rule);
    }

    let mut ordered: Vec<(Option<&Category>, Vec<&RuleRecord>)> = groups
        .into_iter()
        .map(|(key, rules)| (key.and_then(|id| known.get(id).copied()), rules))
        .collect();
    ordered.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a
            .display_order
            .cmp(&b.display_order)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let mut out = String::new();
    out.push_str(OPEN_SENTINEL);
    out.push_str("\n\n");

    for (category, mut rules) in ordered {
        rules.sort_by(|a, b| {
            b.priority_weight
                .cmp(&a.priority_weight)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });

        let heading = category.map(|c| c.name.as_str()).unwrap_or(UNCATEGORIZED_HEADER);
        out.push_str("## ");
        out.push_str(heading);
        out.push_str("\n\n");

        for rule in rules {
            out.push_str(&render_rule_block(rule));
            out.push_str("\n\n");
        }
    }

    out.push_str(CLOSE_SENTINEL);
    out.push('\n');
    out
}
