//! Data-plane resource specs for a joining cluster

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::Ipv4Net;

use super::negotiate::ResolvedCidr;
use super::validate::{parse_coredns_config, parse_image_overrides};
use super::JoinRequest;
use crate::broker::ClusterCredential;
use crate::bundle::HandshakeBundle;
use crate::crd::{
    HealthCheckSpec, ServiceDiscoverySpec, SubmarinerSpec, DEFAULT_IMAGE_VERSION,
    DEFAULT_REPOSITORY,
};
use crate::Result;

/// Broker type understood by the data plane
const BROKER_TYPE: &str = "k8s";

/// Inputs shared by the resource builders
#[derive(Clone, Copy, Debug)]
pub struct ResourceInputs<'a> {
    /// The join request
    pub request: &'a JoinRequest,
    /// Broker bundle
    pub bundle: &'a HandshakeBundle,
    /// Credential issued for this cluster
    pub credential: &'a ClusterCredential,
    /// Namespace the data plane runs in
    pub operator_namespace: &'a str,
}

impl ResourceInputs<'_> {
    fn repository(&self) -> String {
        self.request
            .settings
            .repository
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string())
    }

    fn version(&self) -> String {
        self.request
            .settings
            .image_version
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE_VERSION.to_string())
    }

    fn custom_domains(&self) -> Vec<String> {
        self.request
            .settings
            .custom_domains
            .clone()
            .or_else(|| self.bundle.custom_domains.clone())
            .unwrap_or_default()
    }

    fn broker_ca(&self) -> String {
        self.credential
            .ca_certificate
            .clone()
            .or_else(|| self.bundle.ca_certificate())
            .map(|ca| STANDARD.encode(ca))
            .unwrap_or_default()
    }

    fn broker_namespace(&self) -> String {
        self.bundle
            .namespace()
            .unwrap_or_else(|| self.credential.namespace.clone())
    }
}

/// Spec of the connectivity (`Submariner`) resource
pub fn submariner_spec(
    inputs: &ResourceInputs<'_>,
    service_cidr: &ResolvedCidr,
    pod_cidr: &ResolvedCidr,
    global_cidr: Option<Ipv4Net>,
) -> Result<SubmarinerSpec> {
    let request = inputs.request;
    let settings = &request.settings;

    Ok(SubmarinerSpec {
        broker: BROKER_TYPE.to_string(),
        broker_k8s_api_server: inputs.bundle.broker_host().to_string(),
        broker_k8s_api_server_token: inputs.credential.token.clone(),
        broker_k8s_ca: inputs.broker_ca(),
        broker_k8s_remote_namespace: inputs.broker_namespace(),
        cable_driver: settings.cable_driver.clone().unwrap_or_default(),
        ce_ipsec_debug: settings.ipsec_debug,
        ce_ipsec_force_udp_encaps: settings.force_udp_encaps,
        ce_ipsec_ike_port: settings.ike_port,
        ce_ipsec_natt_port: settings.natt_port,
        ce_ipsec_preferred_server: settings.preferred_server,
        ce_ipsec_psk: inputs
            .bundle
            .psk()
            .map(|psk| STANDARD.encode(psk))
            .unwrap_or_default(),
        cluster_cidr: pod_cidr.recorded(),
        cluster_id: request.cluster_id.clone(),
        service_cidr: service_cidr.recorded(),
        global_cidr: global_cidr.map(|c| c.to_string()).unwrap_or_default(),
        debug: settings.submariner_debug,
        namespace: inputs.operator_namespace.to_string(),
        nat_enabled: settings.nat_traversal,
        load_balancer_enabled: settings.load_balancer_enabled,
        repository: inputs.repository(),
        version: inputs.version(),
        service_discovery_enabled: inputs.bundle.is_service_discovery_enabled(),
        custom_domains: inputs.custom_domains(),
        image_overrides: parse_image_overrides(&request.cluster_id, &settings.image_override_arr)?,
        core_dns_custom_config: parse_coredns_config(
            &request.cluster_id,
            settings.coredns_custom_config_map.as_deref(),
        )?,
        connection_health_check: Some(HealthCheckSpec {
            enabled: settings.health_check_enable,
            interval_seconds: settings.health_check_interval,
            max_packet_loss_count: settings.health_check_max_packet_loss_count,
        }),
    })
}

/// Spec of the service-discovery-only (`ServiceDiscovery`) resource
pub fn service_discovery_spec(inputs: &ResourceInputs<'_>) -> Result<ServiceDiscoverySpec> {
    let request = inputs.request;
    let settings = &request.settings;

    Ok(ServiceDiscoverySpec {
        broker_k8s_api_server: inputs.bundle.broker_host().to_string(),
        broker_k8s_api_server_token: inputs.credential.token.clone(),
        broker_k8s_ca: inputs.broker_ca(),
        broker_k8s_remote_namespace: inputs.broker_namespace(),
        cluster_id: request.cluster_id.clone(),
        debug: settings.submariner_debug,
        namespace: inputs.operator_namespace.to_string(),
        repository: inputs.repository(),
        version: inputs.version(),
        globalnet_enabled: inputs.bundle.is_globalnet_enabled() && request.globalnet_enabled,
        custom_domains: inputs.custom_domains(),
        image_overrides: parse_image_overrides(&request.cluster_id, &settings.image_override_arr)?,
        core_dns_custom_config: parse_coredns_config(
            &request.cluster_id,
            settings.coredns_custom_config_map.as_deref(),
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Component, JoinConfig};
    use crate::join::negotiate::CidrSource;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use std::collections::{BTreeMap, BTreeSet};

    fn bundle() -> HandshakeBundle {
        HandshakeBundle {
            broker_url: "https://broker.example:6443".into(),
            client_token: Some(Secret {
                data: Some(BTreeMap::from([
                    ("token".to_string(), ByteString(b"admin".to_vec())),
                    ("ca.crt".to_string(), ByteString(b"BUNDLE-CA".to_vec())),
                    ("namespace".to_string(), ByteString(b"broker-ns".to_vec())),
                ])),
                ..Default::default()
            }),
            ipsec_psk: Some(Secret {
                data: Some(BTreeMap::from([(
                    "psk".to_string(),
                    ByteString(vec![1, 2, 3]),
                )])),
                ..Default::default()
            }),
            service_discovery: true,
            components: BTreeSet::from([Component::Connectivity, Component::ServiceDiscovery]),
            custom_domains: Some(vec!["clusterset.local".into()]),
        }
    }

    fn credential() -> ClusterCredential {
        ClusterCredential {
            service_account: "cluster-a".into(),
            namespace: "broker-ns".into(),
            token: "cluster-token".into(),
            ca_certificate: None,
        }
    }

    fn cidr(value: &str, source: CidrSource) -> ResolvedCidr {
        ResolvedCidr {
            cidr: value.parse().unwrap(),
            source,
        }
    }

    /// Story: A cluster with a discovered pod CIDR and an explicit service
    /// CIDR. Only the explicit one is written, the broker scheme is gone and
    /// the secrets are base64 encoded.
    #[test]
    fn story_submariner_spec_from_join() {
        let mut config = JoinConfig::for_cluster("cluster-a");
        config.coredns_custom_config_map = Some("kube-system/coredns".into());
        let request = JoinRequest::from_config(&config);
        let bundle = bundle();
        let credential = credential();
        let inputs = ResourceInputs {
            request: &request,
            bundle: &bundle,
            credential: &credential,
            operator_namespace: "submariner-operator",
        };

        let spec = submariner_spec(
            &inputs,
            &cidr("10.96.0.0/12", CidrSource::Explicit),
            &cidr("10.244.0.0/16", CidrSource::Discovered),
            Some("242.0.0.0/16".parse().unwrap()),
        )
        .unwrap();

        assert_eq!(spec.broker, "k8s");
        assert_eq!(spec.broker_k8s_api_server, "broker.example:6443");
        assert_eq!(spec.broker_k8s_api_server_token, "cluster-token");
        assert_eq!(spec.broker_k8s_ca, STANDARD.encode("BUNDLE-CA"));
        assert_eq!(spec.broker_k8s_remote_namespace, "broker-ns");
        assert_eq!(spec.ce_ipsec_psk, STANDARD.encode([1u8, 2, 3]));
        assert_eq!(spec.service_cidr, "10.96.0.0/12");
        assert_eq!(spec.cluster_cidr, "");
        assert_eq!(spec.global_cidr, "242.0.0.0/16");
        assert_eq!(spec.repository, DEFAULT_REPOSITORY);
        assert_eq!(spec.version, DEFAULT_IMAGE_VERSION);
        assert_eq!(spec.custom_domains, vec!["clusterset.local".to_string()]);
        assert_eq!(spec.ce_ipsec_natt_port, 4500);
        assert!(spec.nat_enabled);
        assert!(spec.service_discovery_enabled);
        let dns = spec.core_dns_custom_config.unwrap();
        assert_eq!(dns.namespace, "kube-system");
        assert_eq!(dns.config_map_name, "coredns");
    }

    #[test]
    fn test_request_domains_and_images_win() {
        let mut config = JoinConfig::for_cluster("cluster-a");
        config.custom_domains = Some(vec!["mine.local".into()]);
        config.repository = Some("registry.local/sub".into());
        config.image_version = Some("devel".into());
        let request = JoinRequest::from_config(&config);
        let bundle = bundle();
        let credential = credential();
        let inputs = ResourceInputs {
            request: &request,
            bundle: &bundle,
            credential: &credential,
            operator_namespace: "submariner-operator",
        };

        let spec = service_discovery_spec(&inputs).unwrap();
        assert_eq!(spec.custom_domains, vec!["mine.local".to_string()]);
        assert_eq!(spec.repository, "registry.local/sub");
        assert_eq!(spec.version, "devel");
        assert_eq!(spec.broker_k8s_api_server_token, "cluster-token");
        assert!(!spec.globalnet_enabled);
    }
}
