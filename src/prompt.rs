//! Operator prompt
//!
//! Asked only when neither configuration nor discovery resolved a value. The
//! operator runs unattended, so the shipped [`UnattendedPrompter`] refuses CIDR
//! questions and answers gateway questions from the node list.

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::{Error, Result};

/// Which CIDR is being asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CidrKind {
    /// Pod (cluster) CIDR
    Pod,
    /// Service CIDR
    Service,
}

impl fmt::Display for CidrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => write!(f, "pod"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// External source of answers the operator could not derive
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask for a CIDR of the given kind
    async fn ask_for_cidr(&self, kind: CidrKind) -> Result<String>;

    /// Ask which of `candidates` should become the gateway, `None` for none
    async fn ask_for_gateway_node(&self, candidates: &[String]) -> Result<Option<String>>;
}

/// Non-interactive answers for in-cluster reconciliation
#[derive(Clone, Copy, Debug, Default)]
pub struct UnattendedPrompter;

#[async_trait]
impl Prompter for UnattendedPrompter {
    async fn ask_for_cidr(&self, kind: CidrKind) -> Result<String> {
        Err(Error::unavailable(
            format!("{} CIDR", kind),
            "could not be discovered, set it explicitly in the join configuration",
        ))
    }

    async fn ask_for_gateway_node(&self, candidates: &[String]) -> Result<Option<String>> {
        let choice = candidates.first().cloned();
        if let Some(node) = &choice {
            info!(node = %node, "Selected gateway node");
        }
        Ok(choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unattended_refuses_cidrs() {
        let err = UnattendedPrompter
            .ask_for_cidr(CidrKind::Service)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        assert!(err.to_string().contains("service CIDR"));
    }

    #[tokio::test]
    async fn test_unattended_picks_first_candidate() {
        let nodes = vec!["worker-1".to_string(), "worker-2".to_string()];
        assert_eq!(
            UnattendedPrompter.ask_for_gateway_node(&nodes).await.unwrap(),
            Some("worker-1".to_string())
        );
        assert_eq!(
            UnattendedPrompter.ask_for_gateway_node(&[]).await.unwrap(),
            None
        );
    }
}
