//! Join request validation
//!
//! Everything here fails with [`Error::InvalidInput`] and runs before any
//! side effect, so a bad request never leaves partial state behind.

use std::collections::BTreeMap;

use ipnet::Ipv4Net;

use super::JoinRequest;
use crate::crd::{CoreDnsCustomConfig, VALID_IMAGE_NAMES};
use crate::{Error, Result};

const FIELD_CLUSTER_ID: &str = "spec.joinConfig.clusterID";
const FIELD_GLOBALNET_CIDR: &str = "spec.joinConfig.globalnetCIDR";
const FIELD_CLUSTER_SIZE: &str = "spec.joinConfig.globalnetClusterSize";
const FIELD_COREDNS: &str = "spec.joinConfig.corednsCustomConfigMap";
const FIELD_IMAGE_OVERRIDES: &str = "spec.joinConfig.imageOverrideArr";

/// Check a request before anything is touched
pub fn validate_request(request: &JoinRequest) -> Result<()> {
    validate_cluster_id(&request.cluster_id)?;
    validate_globalnet(request)?;

    for (field, value) in [
        ("spec.joinConfig.serviceCIDR", &request.service_cidr),
        ("spec.joinConfig.clusterCIDR", &request.pod_cidr),
    ] {
        if let Some(cidr) = value {
            parse_network(&request.cluster_id, field, cidr)?;
        }
    }

    parse_coredns_config(&request.cluster_id, request.settings.coredns_custom_config_map.as_deref())?;
    parse_image_overrides(&request.cluster_id, &request.settings.image_override_arr)?;
    Ok(())
}

/// Cluster IDs are DNS-1123 style: lowercase alphanumerics, `.` and `-`,
/// starting and ending with an alphanumeric, at least two characters
pub fn validate_cluster_id(cluster_id: &str) -> Result<()> {
    let bytes = cluster_id.as_bytes();
    let edge_ok = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let inner_ok = |b: &u8| edge_ok(b) || *b == b'.' || *b == b'-';

    let valid = bytes.len() >= 2
        && bytes.first().is_some_and(edge_ok)
        && bytes.last().is_some_and(edge_ok)
        && bytes.iter().all(inner_ok);
    if valid {
        return Ok(());
    }

    Err(Error::invalid_input_for_field(
        cluster_id,
        FIELD_CLUSTER_ID,
        format!(
            "cluster ID {:?} must contain only lowercase alphanumerics, '.' or '-', \
             and start and end with an alphanumeric",
            cluster_id
        ),
    ))
}

fn validate_globalnet(request: &JoinRequest) -> Result<()> {
    let id = &request.cluster_id;
    if let Some(cidr) = &request.global_cidr {
        if request.requested_block_size != 0 {
            return Err(Error::invalid_input_for_field(
                id,
                FIELD_CLUSTER_SIZE,
                "a global CIDR and a global cluster size cannot both be set",
            ));
        }
        if !request.globalnet_enabled {
            return Err(Error::invalid_input_for_field(
                id,
                FIELD_GLOBALNET_CIDR,
                "a global CIDR was set but globalnet is disabled for this cluster",
            ));
        }
        parse_network(id, FIELD_GLOBALNET_CIDR, cidr)?;
    }
    if !request.globalnet_enabled && request.requested_block_size != 0 {
        return Err(Error::invalid_input_for_field(
            id,
            FIELD_CLUSTER_SIZE,
            "a global cluster size was set but globalnet is disabled for this cluster",
        ));
    }
    Ok(())
}

/// Parse an operator-supplied IPv4 network
pub fn parse_network(cluster_id: &str, field: &str, value: &str) -> Result<Ipv4Net> {
    value.trim().parse::<Ipv4Net>().map_err(|e| {
        Error::invalid_input_for_field(
            cluster_id,
            field,
            format!("{:?} is not an IPv4 CIDR: {}", value, e),
        )
    })
}

/// Parse `[namespace/]name` of a custom CoreDNS configmap
pub fn parse_coredns_config(
    cluster_id: &str,
    reference: Option<&str>,
) -> Result<Option<CoreDnsCustomConfig>> {
    let Some(reference) = reference.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };

    let invalid = |msg: &str| {
        Error::invalid_input_for_field(
            cluster_id,
            FIELD_COREDNS,
            format!("{:?} {}, expected [namespace/]name", reference, msg),
        )
    };

    let parts: Vec<&str> = reference.split('/').collect();
    let (namespace, name) = match parts.as_slice() {
        [name] => ("", *name),
        [namespace, name] => (*namespace, *name),
        _ => return Err(invalid("has more than one '/'")),
    };
    if name.is_empty() {
        return Err(invalid("has no configmap name"));
    }

    Ok(Some(CoreDnsCustomConfig {
        config_map_name: name.to_string(),
        namespace: namespace.to_string(),
    }))
}

/// Parse `component=image` overrides
pub fn parse_image_overrides(
    cluster_id: &str,
    overrides: &[String],
) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for entry in overrides {
        let (component, image) = entry
            .split_once('=')
            .map(|(c, i)| (c.trim(), i.trim()))
            .filter(|(c, i)| !c.is_empty() && !i.is_empty())
            .ok_or_else(|| {
                Error::invalid_input_for_field(
                    cluster_id,
                    FIELD_IMAGE_OVERRIDES,
                    format!("{:?} is not of the form component=image", entry),
                )
            })?;
        if !VALID_IMAGE_NAMES.contains(&component) {
            return Err(Error::invalid_input_for_field(
                cluster_id,
                FIELD_IMAGE_OVERRIDES,
                format!(
                    "unknown component {:?}, expected one of: {}",
                    component,
                    VALID_IMAGE_NAMES.join(", ")
                ),
            ));
        }
        parsed.insert(component.to_string(), image.to_string());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::JoinConfig;

    fn request() -> JoinRequest {
        JoinRequest::from_config(&JoinConfig::for_cluster("cluster-a"))
    }

    fn field_of(err: Error) -> Option<String> {
        match err {
            Error::InvalidInput { field, .. } => field,
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn test_cluster_ids() {
        for ok in ["cluster-a", "c1", "east.prod-2", "00"] {
            assert!(validate_cluster_id(ok).is_ok(), "{}", ok);
        }
        for bad in ["", "a", "-a", "a-", "Cluster", "a_b", "a.", "clüster"] {
            let err = validate_cluster_id(bad).unwrap_err();
            assert_eq!(field_of(err).as_deref(), Some(FIELD_CLUSTER_ID), "{}", bad);
        }
    }

    #[test]
    fn test_global_cidr_and_size_are_exclusive() {
        let mut r = request();
        r.global_cidr = Some("242.0.0.0/16".into());
        r.requested_block_size = 1024;
        assert_eq!(
            field_of(validate_request(&r).unwrap_err()).as_deref(),
            Some(FIELD_CLUSTER_SIZE)
        );
    }

    #[test]
    fn test_globalnet_settings_need_globalnet() {
        let mut r = request();
        r.globalnet_enabled = false;
        r.global_cidr = Some("242.0.0.0/16".into());
        assert_eq!(
            field_of(validate_request(&r).unwrap_err()).as_deref(),
            Some(FIELD_GLOBALNET_CIDR)
        );

        let mut r = request();
        r.globalnet_enabled = false;
        r.requested_block_size = 1024;
        assert_eq!(
            field_of(validate_request(&r).unwrap_err()).as_deref(),
            Some(FIELD_CLUSTER_SIZE)
        );

        let mut r = request();
        r.globalnet_enabled = false;
        assert!(validate_request(&r).is_ok());
    }

    #[test]
    fn test_explicit_cidrs_must_parse() {
        let mut r = request();
        r.service_cidr = Some("10.96.0.0/12".into());
        r.pod_cidr = Some("10.244.0.0/16".into());
        assert!(validate_request(&r).is_ok());

        r.pod_cidr = Some("10.244.0.0".into());
        assert_eq!(
            field_of(validate_request(&r).unwrap_err()).as_deref(),
            Some("spec.joinConfig.clusterCIDR")
        );
    }

    #[test]
    fn test_coredns_reference() {
        assert_eq!(parse_coredns_config("c", None).unwrap(), None);
        assert_eq!(parse_coredns_config("c", Some("  ")).unwrap(), None);

        let plain = parse_coredns_config("c", Some("coredns-custom")).unwrap().unwrap();
        assert_eq!(plain.config_map_name, "coredns-custom");
        assert_eq!(plain.namespace, "");

        let namespaced = parse_coredns_config("c", Some("kube-system/coredns")).unwrap().unwrap();
        assert_eq!(namespaced.namespace, "kube-system");
        assert_eq!(namespaced.config_map_name, "coredns");

        assert!(parse_coredns_config("c", Some("a/b/c")).is_err());
        assert!(parse_coredns_config("c", Some("kube-system/")).is_err());
    }

    #[test]
    fn test_image_overrides() {
        let parsed = parse_image_overrides(
            "c",
            &["submariner-gateway=quay.io/me/gw:dev".to_string()],
        )
        .unwrap();
        assert_eq!(parsed["submariner-gateway"], "quay.io/me/gw:dev");

        assert!(parse_image_overrides("c", &["submariner-gateway".to_string()]).is_err());
        assert!(parse_image_overrides("c", &["=image".to_string()]).is_err());
        assert!(parse_image_overrides("c", &["unknown=image".to_string()]).is_err());
    }

    #[test]
    fn test_bad_override_fails_whole_request() {
        let mut r = request();
        r.settings.image_override_arr = vec!["nope=x".into()];
        assert_eq!(
            field_of(validate_request(&r).unwrap_err()).as_deref(),
            Some(FIELD_IMAGE_OVERRIDES)
        );
    }
}
