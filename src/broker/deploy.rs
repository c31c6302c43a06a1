//! Broker deployment
//!
//! Runs on the broker cluster. Sets up access, records the fabric settings in
//! the `Broker` resource and the globalnet registry, and publishes the
//! handshake bundle joining clusters consume.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use tracing::{info, instrument, warn};

use super::BrokerProvisioner;
use crate::bundle::{self, HandshakeBundle};
use crate::crd::{Broker, BrokerConfig, BrokerSpec, Component};
use crate::globalnet::{cidr, AddressRegistryClient};
use crate::materializer::DesiredObject;
use crate::retry::RetryConfig;
use crate::store::{RecordKey, RecordStore};
use crate::{Error, Result, BROKER_INFO_RECORD_NAME, GLOBALNET_RECORD_NAME};

/// Name of the `Broker` resource
pub const BROKER_RESOURCE_NAME: &str = "submariner-broker";

/// Components to deploy.
///
/// At least one component must be listed and every listed component must be
/// selectable. Service discovery and globalnet are added when their switches
/// are on.
pub fn resolve_components(config: &BrokerConfig) -> Result<BTreeSet<Component>> {
    if config.component_arr.is_empty() {
        return Err(Error::invalid_input(
            "at least one component must be provided for deployment",
        ));
    }

    let mut components = BTreeSet::new();
    for name in &config.component_arr {
        let component: Component = name.parse()?;
        if !Component::SELECTABLE.contains(&component) {
            return Err(Error::invalid_input(format!(
                "component {} cannot be listed, enable it with its own setting",
                component
            )));
        }
        components.insert(component);
    }

    if config.service_discovery_enabled {
        components.insert(Component::ServiceDiscovery);
    }
    if config.globalnet_enable {
        components.insert(Component::Globalnet);
    }
    Ok(components)
}

/// Copy of the admin token secret without server-owned metadata
fn portable_token(secret: &Secret) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: secret.metadata.name.clone(),
            namespace: secret.metadata.namespace.clone(),
            ..Default::default()
        },
        data: secret.data.clone(),
        type_: secret.type_.clone(),
        ..Default::default()
    }
}

/// Deploy (or re-deploy) the broker and return the published bundle.
///
/// Re-running with the same configuration changes nothing; the IPsec PSK of
/// an already published bundle is kept.
#[instrument(skip(provisioner, store, config), fields(namespace = %provisioner.namespace()))]
pub async fn deploy_broker(
    provisioner: &BrokerProvisioner,
    store: Arc<dyn RecordStore>,
    config: &BrokerConfig,
    broker_url: &str,
) -> Result<HandshakeBundle> {
    let components = resolve_components(config)?;

    if config.globalnet_enable {
        let supernet = cidr::parse_cidr(&config.globalnet_cidr_range)?;
        cidr::valid_cluster_size(&supernet, config.default_globalnet_cluster_size)?;
    }

    info!(components = ?components, "Setting up broker access");
    let admin_token = provisioner.ensure_admin_access().await?;

    let namespace = provisioner.namespace().to_string();
    let mut broker = Broker::new(
        BROKER_RESOURCE_NAME,
        BrokerSpec {
            components: components.iter().map(Component::to_string).collect(),
            default_custom_domains: config.default_custom_domains.clone(),
            default_globalnet_cluster_size: config.default_globalnet_cluster_size,
            globalnet_cidr_range: config.globalnet_cidr_range.clone(),
            globalnet_enabled: config.globalnet_enable,
        },
    );
    broker.metadata.namespace = Some(namespace.clone());
    let outcome = provisioner
        .materializer()
        .create_or_update(&DesiredObject::from_resource(&broker)?)
        .await?;
    info!(outcome = ?outcome, "Broker resource in place");

    let registry = AddressRegistryClient::new(
        store.clone(),
        RecordKey::new(&namespace, GLOBALNET_RECORD_NAME),
        RetryConfig::registry_update(),
        provisioner.clock(),
    );
    registry
        .ensure_registry(
            config.globalnet_enable,
            &config.globalnet_cidr_range,
            config.default_globalnet_cluster_size,
        )
        .await?;

    let info_key = RecordKey::new(&namespace, BROKER_INFO_RECORD_NAME);
    let ipsec_psk = match bundle::fetch(store.as_ref(), &info_key).await {
        Ok(existing) if existing.psk().is_some() => {
            info!("Reusing IPsec PSK of the published bundle");
            existing.ipsec_psk
        }
        Ok(_) | Err(Error::Unavailable { .. }) => Some(bundle::new_psk_secret()?),
        Err(e) => {
            warn!(error = %e, "Published bundle unreadable, generating a new IPsec PSK");
            Some(bundle::new_psk_secret()?)
        }
    };

    let published = HandshakeBundle {
        broker_url: broker_url.to_string(),
        client_token: Some(portable_token(&admin_token)),
        ipsec_psk,
        service_discovery: config.service_discovery_enabled,
        components,
        custom_domains: (!config.default_custom_domains.is_empty())
            .then(|| config.default_custom_domains.clone()),
    };
    bundle::publish(store.as_ref(), &info_key, &published).await?;

    info!(broker = %broker_url, "Broker deployed");
    Ok(published)
}
