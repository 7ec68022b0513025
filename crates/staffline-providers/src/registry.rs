use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use staffline_core::config::ProviderConfig;
use staffline_core::traits::IntegrationProvider;
use staffline_core::types::IntegrationKind;

use crate::http::HttpProvider;

/// Build the provider map the dispatcher routes integration steps through.
///
/// Kinds without an endpoint are left out; their attempts fail with
/// `ProviderNotConfigured` and follow the normal retry budget.
pub fn build_providers(
    config: &BTreeMap<IntegrationKind, ProviderConfig>,
) -> HashMap<IntegrationKind, Arc<dyn IntegrationProvider>> {
    let mut providers: HashMap<IntegrationKind, Arc<dyn IntegrationProvider>> = HashMap::new();
    for (kind, provider) in config {
        if provider.endpoint.trim().is_empty() {
            warn!(kind = %kind, "Provider has no endpoint, skipping");
            continue;
        }
        info!(kind = %kind, endpoint = %provider.endpoint, timeout_secs = provider.timeout_secs, "Registered integration provider");
        providers.insert(*kind, Arc::new(HttpProvider::new(kind.as_str(), provider)));
    }

    for kind in IntegrationKind::ALL {
        if !providers.contains_key(kind) {
            warn!(kind = %kind, "No provider configured for integration kind");
        }
    }
    providers
}
