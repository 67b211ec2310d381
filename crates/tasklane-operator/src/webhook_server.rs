//! HTTPS server for the admission webhook

use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use tasklane_common::config::WebhookConfig;
use tasklane_webhook::webhook_router;

/// Serve the mutating webhook until the server fails
pub async fn serve_webhook(config: &WebhookConfig) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to load webhook TLS material from {} / {}: {}",
                config.cert_path.display(),
                config.key_path.display(),
                e
            )
        })?;

    info!(addr = %config.listen_addr, "starting admission webhook server");

    axum_server::bind_rustls(config.listen_addr, tls_config)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {}", e))
}
