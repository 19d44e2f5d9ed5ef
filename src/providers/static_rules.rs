//! Static provider: rules parsed once from configuration strings
//!
//! Each string is `server,src-pattern,dst-template[,ping-url]`. The provider
//! emits exactly one change event at start and then blocks until
//! cancellation.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Provider, ProviderId};
use crate::errors::ProviderError;
use crate::rules::Rule;

pub struct StaticProvider {
    rules: Vec<Rule>,
}

/// Parse one `server,src,dst[,ping]` rule string. Fields are positional;
/// the server field is a single host (or `*`).
pub fn parse_rule(spec: &str) -> Result<Vec<Rule>, ProviderError> {
    let fields: Vec<&str> = spec.split(',').map(str::trim).collect();
    let (server, src, dst, ping) = match fields.as_slice() {
        [server, src, dst] => (*server, *src, *dst, None),
        [server, src, dst, ping] => (*server, *src, *dst, Some(*ping)),
        _ => {
            return Err(ProviderError::invalid_rule(
                spec,
                "expected server,src,dst[,ping]",
            ));
        }
    };
    if server.is_empty() || src.is_empty() || dst.is_empty() {
        return Err(ProviderError::invalid_rule(spec, "empty field"));
    }

    let mut rule = Rule::new(server, src, dst, ProviderId::Static)?;
    if let Some(ping) = ping {
        rule = rule.with_ping(ping);
    }
    Ok(vec![rule])
}

impl StaticProvider {
    pub fn new(specs: &[String]) -> Result<Self, ProviderError> {
        let mut rules = Vec::new();
        for spec in specs {
            rules.extend(parse_rule(spec)?);
        }
        Ok(Self { rules })
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Static
    }

    async fn list(&self) -> Result<Vec<Rule>, ProviderError> {
        Ok(self.rules.clone())
    }

    async fn events(&self, tx: mpsc::Sender<ProviderId>, cancel: CancellationToken) {
        let _ = tx.send(self.id()).await;
        cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MatchKind;

    #[test]
    fn parses_three_field_rule() {
        let rules = parse_rule("*,/svc1/(.*),http://u:9000/$1").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].server, "*");
        assert_eq!(rules[0].src, "/svc1/(.*)");
        assert_eq!(rules[0].dst, "http://u:9000/$1");
        assert!(rules[0].ping_url.is_empty());
    }

    #[test]
    fn parses_rule_with_ping() {
        let rules =
            parse_rule("example.com,^/api/(.*),http://10.0.0.1:8080/$1,http://10.0.0.1:8080/ping")
                .unwrap();
        assert_eq!(rules[0].ping_url, "http://10.0.0.1:8080/ping");
        assert_eq!(rules[0].match_kind, MatchKind::Proxy);
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(parse_rule("too,few").is_err());
        assert!(parse_rule("*,^/broken[,http://u/").is_err());
        assert!(parse_rule(",,http://u/").is_err());
    }

    #[tokio::test]
    async fn emits_once_then_blocks() {
        let provider = StaticProvider::new(&["*,^/,http://u/".to_string()]).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let events = {
            let cancel = cancel.clone();
            tokio::spawn(async move { provider.events(tx, cancel).await })
        };

        assert_eq!(rx.recv().await, Some(ProviderId::Static));
        // no further events until cancellation
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        cancel.cancel();
        events.await.unwrap();
    }
}
