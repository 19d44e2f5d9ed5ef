//! TLS termination
//!
//! Three modes: plain HTTP (`none`), user-supplied certificate and key
//! (`static`), or automatic certificates over ACME HTTP-01 (`auto`) with an
//! on-disk account/certificate cache. The `static` and `auto` modes run a
//! companion HTTP listener that answers ACME challenges and 301-redirects
//! everything else to the HTTPS host.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum_server::tls_rustls::RustlsConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AcmeConfig;
use crate::errors::{AppError, AppResult};

/// HTTP-01 challenge tokens published by the ACME order flow and served by
/// the redirect listener.
pub type ChallengeStore = Arc<DashMap<String, String>>;

/// Certificates considered due for renewal below this remaining validity.
const RENEW_BEFORE_DAYS: i64 = 30;
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    None,
    Static,
    Auto,
}

/// Build the rustls server configuration for the configured mode.
/// `None` mode yields no TLS config; the proxy serves plain HTTP.
pub async fn server_config(
    tls: &crate::config::TlsConfig,
    challenges: ChallengeStore,
) -> AppResult<Option<RustlsConfig>> {
    match tls.mode {
        TlsMode::None => Ok(None),
        TlsMode::Static => {
            let cert = tls
                .cert_path
                .as_ref()
                .ok_or_else(|| AppError::tls("static mode requires cert_path"))?;
            let key = tls
                .key_path
                .as_ref()
                .ok_or_else(|| AppError::tls("static mode requires key_path"))?;
            let config = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| AppError::tls(format!("loading certificate: {e}")))?;
            info!(cert = %cert.display(), "serving with static TLS material");
            Ok(Some(config))
        }
        TlsMode::Auto => {
            let acme = tls.acme.clone();
            let (cert_pem, key_pem) = {
                let challenges = challenges.clone();
                tokio::task::spawn_blocking(move || obtain_certificate(&acme, challenges))
                    .await
                    .map_err(|e| AppError::tls(format!("acme task: {e}")))??
            };
            let config = RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
                .await
                .map_err(|e| AppError::tls(format!("acme certificate: {e}")))?;
            Ok(Some(config))
        }
    }
}

/// Periodically re-check certificate validity and hot-reload the rustls
/// config when the ACME flow produced fresh material.
pub async fn renewal_loop(
    config: RustlsConfig,
    acme: AcmeConfig,
    challenges: ChallengeStore,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RENEWAL_CHECK_INTERVAL) => {}
        }

        let acme = acme.clone();
        let challenges = challenges.clone();
        let obtained =
            tokio::task::spawn_blocking(move || obtain_certificate(&acme, challenges)).await;
        match obtained {
            Ok(Ok((cert_pem, key_pem))) => {
                if let Err(e) = config
                    .reload_from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
                    .await
                {
                    error!(error = %e, "failed to reload renewed certificate");
                } else {
                    debug!("certificate reloaded");
                }
            }
            Ok(Err(e)) => warn!(error = %e, "certificate renewal failed"),
            Err(e) => warn!(error = %e, "certificate renewal task failed"),
        }
    }
}

/// Run the blocking ACME order flow: return the cached certificate when it
/// is still comfortably valid, otherwise order a new one, publishing HTTP-01
/// tokens into the challenge store along the way.
fn obtain_certificate(
    acme: &AcmeConfig,
    challenges: ChallengeStore,
) -> AppResult<(String, String)> {
    use acme_lib::persist::FilePersist;
    use acme_lib::{Directory, DirectoryUrl, create_p384_key};

    let primary = acme
        .fqdns
        .first()
        .ok_or_else(|| AppError::tls("auto mode requires at least one fqdn"))?;
    let alts: Vec<&str> = acme.fqdns.iter().skip(1).map(String::as_str).collect();

    std::fs::create_dir_all(&acme.cache_dir)?;
    let persist = FilePersist::new(&acme.cache_dir);
    let url = match &acme.directory_url {
        Some(u) => DirectoryUrl::Other(u),
        None => DirectoryUrl::LetsEncrypt,
    };
    let dir = Directory::from_url(persist, url)
        .map_err(|e| AppError::tls(format!("acme directory: {e}")))?;

    let email = acme
        .email
        .clone()
        .unwrap_or_else(|| format!("admin@{primary}"));
    let account = dir
        .account(&email)
        .map_err(|e| AppError::tls(format!("acme account: {e}")))?;

    if let Ok(Some(cert)) = account.certificate(primary) {
        if cert.valid_days_left() > RENEW_BEFORE_DAYS {
            debug!(domain = %primary, days_left = cert.valid_days_left(), "using cached certificate");
            return Ok((cert.certificate().to_string(), cert.private_key().to_string()));
        }
    }

    info!(domain = %primary, alts = alts.len(), "ordering certificate");
    let mut order = account
        .new_order(primary, &alts)
        .map_err(|e| AppError::tls(format!("acme order: {e}")))?;

    let csr_order = loop {
        if let Some(csr) = order.confirm_validations() {
            break csr;
        }
        let auths = order
            .authorizations()
            .map_err(|e| AppError::tls(format!("acme authorizations: {e}")))?;
        for auth in &auths {
            let challenge = auth.http_challenge();
            let token = challenge.http_token().to_string();
            let proof = challenge.http_proof();
            debug!(token = %token, "publishing http-01 challenge");
            challenges.insert(token.clone(), proof);
            let result = challenge.validate(5000);
            challenges.remove(&token);
            result.map_err(|e| AppError::tls(format!("acme validation: {e}")))?;
        }
        order
            .refresh()
            .map_err(|e| AppError::tls(format!("acme refresh: {e}")))?;
    };

    let key = create_p384_key();
    let cert_order = csr_order
        .finalize_pkey(key, 5000)
        .map_err(|e| AppError::tls(format!("acme finalize: {e}")))?;
    let cert = cert_order
        .download_and_save_cert()
        .map_err(|e| AppError::tls(format!("acme download: {e}")))?;

    info!(domain = %primary, "certificate obtained");
    Ok((cert.certificate().to_string(), cert.private_key().to_string()))
}

#[derive(Clone)]
struct RedirectState {
    challenges: ChallengeStore,
    https_port: u16,
}

/// Companion HTTP listener router: answers ACME challenges and redirects
/// everything else to the HTTPS host.
pub fn redirect_router(challenges: ChallengeStore, https_port: u16) -> Router {
    async fn challenge(
        State(state): State<RedirectState>,
        Path(token): Path<String>,
    ) -> Response {
        match state.challenges.get(&token) {
            Some(proof) => proof.value().clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn redirect(
        State(state): State<RedirectState>,
        headers: axum::http::HeaderMap,
        uri: Uri,
    ) -> Response {
        let Some(host) = crate::utils::request_host(&headers, &uri) else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let authority = if state.https_port == 443 {
            host
        } else {
            format!("{host}:{}", state.https_port)
        };
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{authority}{path_and_query}");
        (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, location)],
        )
            .into_response()
    }

    Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            axum::routing::get(challenge),
        )
        .fallback(redirect)
        .with_state(RedirectState {
            challenges,
            https_port,
        })
}
