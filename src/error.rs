use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("collection configuration is invalid: {}", .0.join(" "))]
    ConfigurationInvalid(Vec<String>),
    #[error("collection {collection_id} is locked by harvest {harvest_id}")]
    Locked {
        collection_id: String,
        harvest_id: String,
    },
    #[error("changeset rejected: {0}")]
    ChangesetInvalid(String),
    #[error("file relay failed while processing {0}")]
    RelayFailure(String),
    #[error("collection configuration not found: {0}")]
    MissingCollection(String),
    #[error("no changes in collection configuration")]
    NoChanges,
    #[error(
        "collection {collection_id} was changed at {stored}; the submitted copy has {}",
        .submitted.as_deref().unwrap_or("no timestamp")
    )]
    StaleConfig {
        collection_id: String,
        stored: String,
        submitted: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestErrorCode {
    E001Locked,
    E002ConfigInvalid,
    E003ChangesetInvalid,
    E004RelayFailed,
    E005ConfigMissing,
    E006StaleConfig,
}

impl HarvestErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Locked => "E001_LOCKED",
            Self::E002ConfigInvalid => "E002_CONFIG_INVALID",
            Self::E003ChangesetInvalid => "E003_CHANGESET_INVALID",
            Self::E004RelayFailed => "E004_RELAY_FAILED",
            Self::E005ConfigMissing => "E005_CONFIG_MISSING",
            Self::E006StaleConfig => "E006_STALE_CONFIG",
        }
    }
}

impl HarvestError {
    pub fn code(&self) -> Option<HarvestErrorCode> {
        match self {
            Self::Locked { .. } => Some(HarvestErrorCode::E001Locked),
            Self::ConfigurationInvalid(_) => Some(HarvestErrorCode::E002ConfigInvalid),
            Self::ChangesetInvalid(_) => Some(HarvestErrorCode::E003ChangesetInvalid),
            Self::RelayFailure(_) => Some(HarvestErrorCode::E004RelayFailed),
            Self::MissingCollection(_) => Some(HarvestErrorCode::E005ConfigMissing),
            Self::StaleConfig { .. } => Some(HarvestErrorCode::E006StaleConfig),
            Self::NoChanges => None,
        }
    }
}

/// Finds the typed error anywhere in an `anyhow` chain, including context layers.
pub fn find_harvest_error(err: &anyhow::Error) -> Option<&HarvestError> {
    err.downcast_ref::<HarvestError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<HarvestError>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn configuration_invalid_lists_every_reason() {
        let err = HarvestError::ConfigurationInvalid(vec![
            "Missing id.".to_string(),
            "Missing keys.".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "collection configuration is invalid: Missing id. Missing keys."
        );
    }

    #[test]
    fn relay_failure_is_found_behind_context() {
        let err = Err::<(), _>(anyhow::anyhow!("bucket unreachable"))
            .context(HarvestError::RelayFailure("publish a.json".to_string()))
            .unwrap_err();
        let found = find_harvest_error(&err).expect("typed error");
        assert_eq!(found.code(), Some(HarvestErrorCode::E004RelayFailed));
        assert_eq!(
            format!("{err:#}"),
            "file relay failed while processing publish a.json: bucket unreachable"
        );
    }
}
