//! Request-to-rule matching
//!
//! The active snapshot is sorted longest-pattern-first, so a linear scan
//! returns the most specific rule on its first hit. Matching is a pure
//! function over the snapshot; destination selection among a group of
//! equivalent rules is the balancer's job.

use std::sync::Arc;

use super::{MatchKind, Rule};

/// The outcome of matching one request against the active snapshot:
/// the chosen rule plus its fully expanded destination.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub rule: Arc<Rule>,
    /// `dst` with `$N` back-references substituted from the path captures
    pub destination: String,
    pub kind: MatchKind,
}

/// All rules sharing the first-matching `(server, src)` pair, in snapshot
/// order (provider precedence preserved by the aggregator's stable sort).
#[derive(Debug)]
pub struct MatchGroup {
    pub rules: Vec<Arc<Rule>>,
}

impl MatchGroup {
    pub fn group_key(&self) -> String {
        self.rules[0].group_key()
    }
}

/// Find the best-matching rule group for `(server_name, path)`.
///
/// `server_name` must be lowercased with the port stripped. Returns `None`
/// when no rule's host scope and source pattern both match.
pub fn best_match(snapshot: &[Arc<Rule>], server_name: &str, path: &str) -> Option<MatchGroup> {
    let first = snapshot
        .iter()
        .find(|rule| rule.matches_host(server_name) && rule.src_re.is_match(path))?;

    // collect every alternative destination for the winning (server, src)
    let key = first.group_key();
    let rules = snapshot
        .iter()
        .filter(|rule| rule.group_key() == key)
        .cloned()
        .collect();
    Some(MatchGroup { rules })
}

/// Expand a rule's destination template against the captures of `path`.
///
/// `$0` is the whole match, `$1`..`$N` the capture groups. Returns `None`
/// when the pattern unexpectedly no longer matches.
pub fn expand_destination(rule: &Rule, path: &str) -> Option<String> {
    let caps = rule.src_re.captures(path)?;
    match rule.match_kind {
        // static rules keep their raw destination; nothing to substitute
        MatchKind::Static => Some(rule.dst.clone()),
        MatchKind::Proxy => {
            let mut out = String::with_capacity(rule.dst.len() + path.len());
            caps.expand(&rule.dst, &mut out);
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderId;

    fn rules(specs: &[(&str, &str, &str)]) -> Vec<Arc<Rule>> {
        let mut list: Vec<Arc<Rule>> = specs
            .iter()
            .map(|(server, src, dst)| {
                Arc::new(Rule::new(*server, *src, *dst, ProviderId::Static).unwrap())
            })
            .collect();
        // the aggregator publishes longest-pattern-first; mirror that here
        list.sort_by(|a, b| b.src.len().cmp(&a.src.len()));
        list
    }

    #[test]
    fn capture_expansion() {
        let snapshot = rules(&[("*", "/svc1/(.*)", "http://u:9000/$1")]);
        let group = best_match(&snapshot, "host", "/svc1/abc").unwrap();
        let dst = expand_destination(&group.rules[0], "/svc1/abc").unwrap();
        assert_eq!(dst, "http://u:9000/abc");
    }

    #[test]
    fn longest_pattern_wins() {
        let snapshot = rules(&[
            ("*", "^/api/(.*)", "http://a/$1"),
            ("*", "^/api/v2/(.*)", "http://b/$1"),
        ]);
        let group = best_match(&snapshot, "host", "/api/v2/x").unwrap();
        assert_eq!(group.rules[0].dst, "http://b/$1");

        let group = best_match(&snapshot, "host", "/api/v1/x").unwrap();
        assert_eq!(group.rules[0].dst, "http://a/$1");
    }

    #[test]
    fn host_specificity() {
        let snapshot = rules(&[("example.com", "^/", "http://x/"), ("*", "^/", "http://y/")]);
        // equal pattern lengths: snapshot order decides, host scope filters
        let group = best_match(&snapshot, "example.com", "/").unwrap();
        assert_eq!(group.rules[0].dst, "http://x/");

        let group = best_match(&snapshot, "other.com", "/").unwrap();
        assert_eq!(group.rules[0].dst, "http://y/");
    }

    #[test]
    fn no_match_returns_none() {
        let snapshot = rules(&[("example.com", "^/api/", "http://x/")]);
        assert!(best_match(&snapshot, "example.com", "/other").is_none());
        assert!(best_match(&snapshot, "unknown.com", "/api/").is_none());
    }

    #[test]
    fn groups_collect_alternative_destinations() {
        let snapshot = rules(&[
            ("*", "^/svc/(.*)", "http://a/$1"),
            ("*", "^/svc/(.*)", "http://b/$1"),
            ("*", "^/other/(.*)", "http://c/$1"),
        ]);
        let group = best_match(&snapshot, "host", "/svc/x").unwrap();
        assert_eq!(group.rules.len(), 2);
        let dsts: Vec<_> = group.rules.iter().map(|r| r.dst.as_str()).collect();
        assert!(dsts.contains(&"http://a/$1"));
        assert!(dsts.contains(&"http://b/$1"));
    }

    #[test]
    fn expansion_is_idempotent_given_same_input() {
        let snapshot = rules(&[("*", "/svc1/(.*)", "http://u:9000/$1")]);
        let rule = &best_match(&snapshot, "h", "/svc1/abc").unwrap().rules[0];
        let a = expand_destination(rule, "/svc1/abc").unwrap();
        let b = expand_destination(rule, "/svc1/abc").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn whole_match_backreference() {
        let snapshot = rules(&[("*", "/legacy.*", "http://old-app$0")]);
        let rule = &best_match(&snapshot, "h", "/legacy/x").unwrap().rules[0];
        assert_eq!(
            expand_destination(rule, "/legacy/x").unwrap(),
            "http://old-app/legacy/x"
        );
    }
}
