//! Effective-set resolution
//!
//! Given a layer and a caller, pick the approved rules that apply and put
//! them in render order. Resolution is pure; the caller supplies the rule
//! catalog.

use std::cmp::Ordering;

use crate::model::{Caller, Rule, RuleStatus, TargetLayer};

/// Whether an approved rule applies to `caller`, ignoring its layer
///
/// - global rules (no owning team) need `force` or an inheriting caller
/// - team rules need a targeted team or user in common with the caller, or
///   are team-wide (no targets) and the caller belongs to the owning team
pub fn applies_to(rule: &Rule, caller: &Caller) -> bool {
    match &rule.team_id {
        None => rule.force || caller.inherits_global,
        Some(owner) => {
            let team_hit = rule
                .target_teams
                .iter()
                .any(|t| caller.team_ids.iter().any(|c| c == t));
            let user_hit = rule.target_users.iter().any(|u| *u == caller.user_id);
            let team_wide = rule.is_team_wide() && caller.team_ids.iter().any(|t| t == owner);
            team_hit || user_hit || team_wide
        }
    }
}

/// Render order: global before team, forced first, heavier first, then by name
pub fn render_order(a: &Rule, b: &Rule) -> Ordering {
    let scope_key = |r: &Rule| if r.is_global() { 0u8 } else { 1u8 };
    scope_key(a)
        .cmp(&scope_key(b))
        .then_with(|| b.force.cmp(&a.force))
        .then_with(|| b.priority_weight.cmp(&a.priority_weight))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

/// Approved rules of `layer` that apply to `caller`, in render order
pub fn resolve_layer(rules: &[Rule], layer: TargetLayer, caller: &Caller) -> Vec<Rule> {
    let mut out: Vec<Rule> = rules
        .iter()
        .filter(|r| r.status == RuleStatus::Approved)
        .filter(|r| r.target_layer == layer)
        .filter(|r| applies_to(r, caller))
        .cloned()
        .collect();
    out.sort_by(render_order);
    out
}

/// Effective set across every layer, outermost layer first
pub fn resolve_all(rules: &[Rule], caller: &Caller) -> Vec<Rule> {
    TargetLayer::ALL
        .iter()
        .flat_map(|layer| resolve_layer(rules, *layer, caller))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRule;
    use chrono::Utc;

    fn approved(id: &str, layer: TargetLayer) -> Rule {
        let mut r = NewRule::new(id, "body", layer)
            .into_rule(id.to_string(), "admin", Utc::now())
            .unwrap();
        r.status = RuleStatus::Approved;
        r
    }

    fn team_rule(id: &str, owner: &str) -> Rule {
        let mut r = approved(id, TargetLayer::Project);
        r.team_id = Some(owner.into());
        r
    }

    #[test]
    fn test_global_rules_need_force_or_inheritance() {
        let plain = approved("plain", TargetLayer::Organization);
        let mut forced = approved("forced", TargetLayer::Organization);
        forced.force = true;
        let rules = vec![plain, forced];

        let isolated = Caller::new("u").with_teams(vec!["web".into()]);
        let ids: Vec<_> = resolve_layer(&rules, TargetLayer::Organization, &isolated)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["forced"]);

        let inheriting = isolated.inheriting_global(true);
        assert_eq!(
            resolve_layer(&rules, TargetLayer::Organization, &inheriting).len(),
            2
        );
    }

    #[test]
    fn test_team_rule_targeting() {
        let mut by_team = team_rule("by-team", "platform");
        by_team.target_teams = vec!["web".into()];
        let mut by_user = team_rule("by-user", "platform");
        by_user.target_users = vec!["carol".into()];
        let wide = team_rule("wide", "web");
        let other = team_rule("other", "mobile");
        let rules = vec![by_team, by_user, wide, other];

        let dave = Caller::new("dave").with_teams(vec!["web".into()]);
        let ids: Vec<_> = resolve_layer(&rules, TargetLayer::Project, &dave)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["by-team", "wide"]);

        let carol = Caller::new("carol");
        let ids: Vec<_> = resolve_layer(&rules, TargetLayer::Project, &carol)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["by-user"]);
    }

    #[test]
    fn test_layer_and_status_filter() {
        let mut draft = approved("draft", TargetLayer::Project);
        draft.status = RuleStatus::Draft;
        draft.force = true;
        let mut other_layer = approved("local", TargetLayer::Local);
        other_layer.force = true;
        let caller = Caller::new("u");
        assert!(resolve_layer(&[draft, other_layer], TargetLayer::Project, &caller).is_empty());
    }

    #[test]
    fn test_render_order() {
        let mut team = team_rule("t", "web");
        team.priority_weight = 100;
        let mut light = approved("b-light", TargetLayer::Project);
        light.force = true;
        light.priority_weight = 1;
        let mut heavy = approved("a-heavy", TargetLayer::Project);
        heavy.force = true;
        heavy.priority_weight = 5;
        let mut unforced = approved("c-unforced", TargetLayer::Project);
        unforced.priority_weight = 50;
        let mut twin = approved("a-twin", TargetLayer::Project);
        twin.force = true;
        twin.priority_weight = 5;

        let caller = Caller::new("u")
            .with_teams(vec!["web".into()])
            .inheriting_global(true);
        let ids: Vec<_> = resolve_layer(
            &[team, light, unforced, heavy, twin],
            TargetLayer::Project,
            &caller,
        )
        .into_iter()
        .map(|r| r.id)
        .collect();
        assert_eq!(ids, vec!["a-heavy", "a-twin", "b-light", "c-unforced", "t"]);
    }

    #[test]
    fn test_resolve_all_orders_layers() {
        let mut local = approved("l", TargetLayer::Local);
        local.force = true;
        let mut ent = approved("e", TargetLayer::Enterprise);
        ent.force = true;
        let ids: Vec<_> = resolve_all(&[local, ent], &Caller::new("u"))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["e", "l"]);
    }
}
