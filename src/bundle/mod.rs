//! Broker handshake bundle
//!
//! Everything a joining cluster needs to reach and authenticate to the broker:
//! API server URL, a bearer credential with its CA, the fabric-wide IPsec
//! pre-shared key, the enabled components and custom domains.
//!
//! The transport form is URL-safe base64 of the JSON document, padded on
//! encode and accepted with or without padding on decode. On the broker the
//! same string is stored under [`BUNDLE_DATA_KEY`] of the `broker-info`
//! record.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crd::Component;
use crate::store::{CreateOutcome, PutOutcome, RecordData, RecordKey, RecordStore};
use crate::{Error, Result};

/// Data key holding the encoded bundle in the broker-info record
pub const BUNDLE_DATA_KEY: &str = "brokerInfo";

/// Name of the secret carrying the IPsec pre-shared key
pub const PSK_SECRET_NAME: &str = "submariner-ipsec-psk";

/// Secret data key for the pre-shared key
pub const PSK_DATA_KEY: &str = "psk";

/// Length of a generated pre-shared key in bytes
pub const PSK_LENGTH: usize = 48;

const TOKEN_KEY: &str = "token";
const CA_KEY: &str = "ca.crt";
const NAMESPACE_KEY: &str = "namespace";

const BUNDLE_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Portable broker access and fabric configuration
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeBundle {
    /// Broker API server URL
    #[serde(rename = "brokerURL")]
    pub broker_url: String,
    /// Service account token secret granting access to the broker namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<Secret>,
    /// Fabric-wide IPsec pre-shared key
    #[serde(rename = "ipsecPSK", default, skip_serializing_if = "Option::is_none")]
    pub ipsec_psk: Option<Secret>,
    /// Whether service discovery is enabled fabric-wide
    #[serde(default)]
    pub service_discovery: bool,
    /// Enabled fabric components
    #[serde(default)]
    pub components: BTreeSet<Component>,
    /// Custom cluster domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domains: Option<Vec<String>>,
}

impl fmt::Debug for HandshakeBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of logs
        f.debug_struct("HandshakeBundle")
            .field("broker_url", &self.broker_url)
            .field("client_token", &self.client_token.as_ref().map(|_| "<redacted>"))
            .field("ipsec_psk", &self.ipsec_psk.as_ref().map(|_| "<redacted>"))
            .field("service_discovery", &self.service_discovery)
            .field("components", &self.components)
            .field("custom_domains", &self.custom_domains)
            .finish()
    }
}

fn secret_value(secret: Option<&Secret>, key: &str) -> Option<Vec<u8>> {
    secret?
        .data
        .as_ref()?
        .get(key)
        .map(|ByteString(bytes)| bytes.clone())
}

fn secret_string(secret: Option<&Secret>, key: &str) -> Option<String> {
    secret_value(secret, key).and_then(|b| String::from_utf8(b).ok())
}

impl HandshakeBundle {
    /// Bearer token for the broker API server
    pub fn token(&self) -> Option<String> {
        secret_string(self.client_token.as_ref(), TOKEN_KEY)
    }

    /// PEM CA bundle of the broker API server
    pub fn ca_certificate(&self) -> Option<String> {
        secret_string(self.client_token.as_ref(), CA_KEY)
    }

    /// Namespace the client token is scoped to
    pub fn namespace(&self) -> Option<String> {
        secret_string(self.client_token.as_ref(), NAMESPACE_KEY)
    }

    /// Raw IPsec pre-shared key
    pub fn psk(&self) -> Option<Vec<u8>> {
        secret_value(self.ipsec_psk.as_ref(), PSK_DATA_KEY)
    }

    /// Whether connectivity (gateways and tunnels) is enabled
    pub fn is_connectivity_enabled(&self) -> bool {
        self.components.contains(&Component::Connectivity)
    }

    /// Whether service discovery is enabled
    pub fn is_service_discovery_enabled(&self) -> bool {
        self.service_discovery || self.components.contains(&Component::ServiceDiscovery)
    }

    /// Whether global addressing is enabled
    pub fn is_globalnet_enabled(&self) -> bool {
        self.components.contains(&Component::Globalnet)
    }

    /// Broker URL without the scheme, as the data plane expects it
    pub fn broker_host(&self) -> &str {
        match self.broker_url.find("://") {
            Some(i) => &self.broker_url[i + 3..],
            None => &self.broker_url,
        }
    }
}

/// Serialize a bundle into its transport string
pub fn encode(bundle: &HandshakeBundle) -> Result<String> {
    let json = serde_json::to_vec(bundle)
        .map_err(|e| Error::serialization(format!("broker bundle: {}", e)))?;
    Ok(BUNDLE_ENGINE.encode(json))
}

/// Parse a transport string
pub fn decode(encoded: &str) -> Result<HandshakeBundle> {
    let json = BUNDLE_ENGINE
        .decode(encoded.trim())
        .map_err(|e| Error::malformed_bundle(format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::malformed_bundle(format!("invalid JSON: {}", e)))
}

/// Generate a fresh random pre-shared key secret
pub fn new_psk_secret() -> Result<Secret> {
    let mut psk = vec![0u8; PSK_LENGTH];
    aws_lc_rs::rand::fill(&mut psk)
        .map_err(|_| Error::dependency("random", "failed to generate IPsec PSK"))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(PSK_SECRET_NAME.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            PSK_DATA_KEY.to_string(),
            ByteString(psk),
        )])),
        ..Default::default()
    })
}

fn to_record(bundle: &HandshakeBundle) -> Result<RecordData> {
    Ok(RecordData::from([(BUNDLE_DATA_KEY.to_string(), encode(bundle)?)]))
}

/// Store a bundle as the shared broker-info record.
///
/// Last writer wins; a concurrent write between read and replace is reported
/// as [`Error::Conflict`] instead of being retried.
pub async fn publish(
    store: &dyn RecordStore,
    key: &RecordKey,
    bundle: &HandshakeBundle,
) -> Result<()> {
    let data = to_record(bundle)?;
    if store.create(key, data.clone()).await? == CreateOutcome::Created {
        info!(record = %key, "Published broker bundle");
        return Ok(());
    }

    let Some(current) = store.get(key).await? else {
        return Err(Error::conflict(key.to_string(), 1));
    };
    if current.data == data {
        debug!(record = %key, "Broker bundle unchanged");
        return Ok(());
    }
    match store.put_if_version(key, data, &current.version).await? {
        PutOutcome::Written => {
            info!(record = %key, "Updated broker bundle");
            Ok(())
        }
        PutOutcome::Conflict => Err(Error::conflict(key.to_string(), 1)),
    }
}

/// Read the bundle from the shared broker-info record
pub async fn fetch(store: &dyn RecordStore, key: &RecordKey) -> Result<HandshakeBundle> {
    let record = store
        .get(key)
        .await?
        .ok_or_else(|| Error::unavailable(key.to_string(), "broker bundle not published yet"))?;
    let encoded = record.data.get(BUNDLE_DATA_KEY).ok_or_else(|| {
        Error::malformed_bundle(format!("{} has no {} entry", key, BUNDLE_DATA_KEY))
    })?;
    decode(encoded)
}

/// Change the administrator-controlled fields of a published bundle
pub async fn update_features(
    store: &dyn RecordStore,
    key: &RecordKey,
    components: BTreeSet<Component>,
    custom_domains: Option<Vec<String>>,
) -> Result<HandshakeBundle> {
    let mut bundle = fetch(store, key).await?;
    bundle.service_discovery = components.contains(&Component::ServiceDiscovery);
    bundle.components = components;
    bundle.custom_domains = custom_domains;
    publish(store, key, &bundle).await?;
    Ok(bundle)
}
