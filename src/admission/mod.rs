//! Mutating admission webhook
//!
//! A synchronous HTTPS endpoint with two mutation paths: pod creations get
//! their resource requests rewritten to the controlling autoscaler's
//! recommendation, and autoscaler submissions are validated and defaulted.
//!
//! The pod path is strictly best-effort: any internal failure allows the
//! pod through unmodified. Invalid autoscalers, by contrast, are denied
//! with an explanatory message.

pub mod autoscaler;
pub mod pod;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{routing::get, routing::post, Router};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::Store;
use kube::Client;
use tracing::info;

use crate::crd::VerticalAutoscaler;
use crate::error::Error;
use crate::recommend::LimitRangeCalculator;
use crate::target::TargetSelectorFetcher;

/// Name of the webhook configuration object this controller manages
pub const WEBHOOK_CONFIG_NAME: &str = "rightsizer-admission-controller";

/// Annotation key summarising the mutation applied to a pod
pub const UPDATES_ANNOTATION: &str = "rightsizer.dev/updates";

/// Shared state for the webhook handlers. Config reads go through a watch
/// cache snapshot, so concurrent admissions are lock-free and pure.
pub struct AdmissionState {
    /// Watch cache of autoscaler configurations
    pub autoscalers: Store<VerticalAutoscaler>,
    /// Resolves target references to pod selectors
    pub selector_fetcher: Arc<dyn TargetSelectorFetcher>,
    /// Effective namespace LimitRanges
    pub limit_ranges: Arc<dyn LimitRangeCalculator>,
}

/// Build the webhook router with all mutation endpoints
pub fn admission_router(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route("/mutate/pods", post(pod::mutate_handler))
        .route("/mutate/autoscalers", post(autoscaler::mutate_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// TLS material and registration parameters for the webhook server
#[derive(Clone, Debug)]
pub struct WebhookOptions {
    /// Listen address of the HTTPS server
    pub listen: SocketAddr,
    /// Path to the PEM server certificate
    pub tls_cert: PathBuf,
    /// Path to the PEM private key
    pub tls_key: PathBuf,
    /// Register the MutatingWebhookConfiguration at startup
    pub register: bool,
    /// Register by URL instead of by service reference
    pub register_by_url: bool,
    /// External address clients reach the webhook under (URL mode)
    pub webhook_address: Option<String>,
    /// Port the API server should dial
    pub webhook_port: u16,
    /// Service name for service-reference registration
    pub service_name: String,
    /// Namespace of that service
    pub service_namespace: String,
}

/// Serve the webhook over HTTPS until the process stops
pub async fn serve(state: Arc<AdmissionState>, options: &WebhookOptions) -> Result<(), Error> {
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
        &options.tls_cert,
        &options.tls_key,
    )
    .await
    .map_err(|e| Error::validation(format!("loading webhook TLS material: {e}")))?;

    let router = admission_router(state);
    info!(addr = %options.listen, "admission webhook listening");
    axum_server::bind_rustls(options.listen, tls)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::validation(format!("webhook server failed: {e}")))
}

/// Create or update the MutatingWebhookConfiguration pointing the API
/// server at this controller
pub async fn register_webhook(client: Client, options: &WebhookOptions) -> Result<(), Error> {
    let ca_bundle = tokio::fs::read(&options.tls_cert)
        .await
        .map_err(|e| Error::validation(format!("reading CA bundle: {e}")))?;

    let client_config = |path: &str| {
        if options.register_by_url {
            let address = options
                .webhook_address
                .clone()
                .unwrap_or_else(|| "localhost".to_string());
            WebhookClientConfig {
                url: Some(format!(
                    "https://{}:{}{}",
                    address, options.webhook_port, path
                )),
                ca_bundle: Some(ByteString(ca_bundle.clone())),
                service: None,
            }
        } else {
            WebhookClientConfig {
                service: Some(ServiceReference {
                    name: options.service_name.clone(),
                    namespace: options.service_namespace.clone(),
                    path: Some(path.to_string()),
                    port: Some(options.webhook_port.into()),
                }),
                ca_bundle: Some(ByteString(ca_bundle.clone())),
                url: None,
            }
        }
    };

    let ignore = Some("Ignore".to_string());
    let fail = Some("Fail".to_string());
    let configuration = MutatingWebhookConfiguration {
        metadata: kube::api::ObjectMeta {
            name: Some(WEBHOOK_CONFIG_NAME.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![
            MutatingWebhook {
                name: "pods.rightsizer.dev".to_string(),
                admission_review_versions: vec!["v1".to_string()],
                client_config: client_config("/mutate/pods"),
                // Pod creation must never block on this webhook.
                failure_policy: ignore.clone(),
                side_effects: "None".to_string(),
                rules: Some(vec![RuleWithOperations {
                    api_groups: Some(vec!["".to_string()]),
                    api_versions: Some(vec!["v1".to_string()]),
                    operations: Some(vec!["CREATE".to_string()]),
                    resources: Some(vec!["pods".to_string()]),
                    scope: Some("Namespaced".to_string()),
                }]),
                ..Default::default()
            },
            MutatingWebhook {
                name: "autoscalers.rightsizer.dev".to_string(),
                admission_review_versions: vec!["v1".to_string()],
                client_config: client_config("/mutate/autoscalers"),
                // Invalid configs must be rejected, so failures surface.
                failure_policy: fail,
                side_effects: "None".to_string(),
                rules: Some(vec![RuleWithOperations {
                    api_groups: Some(vec!["autoscaling.rightsizer.dev".to_string()]),
                    api_versions: Some(vec!["v1alpha1".to_string()]),
                    operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                    resources: Some(vec!["verticalautoscalers".to_string()]),
                    scope: Some("Namespaced".to_string()),
                }]),
                ..Default::default()
            },
        ]),
    };

    let api: Api<MutatingWebhookConfiguration> = Api::all(client);
    api.patch(
        WEBHOOK_CONFIG_NAME,
        &PatchParams::apply("rightsizer-admission").force(),
        &Patch::Apply(&configuration),
    )
    .await?;
    info!(name = WEBHOOK_CONFIG_NAME, "webhook configuration registered");
    Ok(())
}
