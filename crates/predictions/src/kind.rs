use serde::{Deserialize, Serialize};

use artforge_core::DomainError;

/// The fixed set of image operations a user can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Generate,
    Edit,
    StyleTransfer,
    Avatar,
    ResolutionImprove,
    RemoveBg,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Generate,
        OperationKind::Edit,
        OperationKind::StyleTransfer,
        OperationKind::Avatar,
        OperationKind::ResolutionImprove,
        OperationKind::RemoveBg,
    ];

    /// URL slug, also the persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::Edit => "edit",
            OperationKind::StyleTransfer => "style-transfer",
            OperationKind::Avatar => "avatar",
            OperationKind::ResolutionImprove => "resolution-improve",
            OperationKind::RemoveBg => "remove-bg",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Generate => "Generated image",
            OperationKind::Edit => "Edited image",
            OperationKind::StyleTransfer => "Style transfer",
            OperationKind::Avatar => "Avatar",
            OperationKind::ResolutionImprove => "Upscaled image",
            OperationKind::RemoveBg => "Background removed",
        }
    }

    /// Points charged when no override is configured.
    pub fn default_cost(&self) -> u64 {
        match self {
            OperationKind::Generate => 10,
            OperationKind::Edit | OperationKind::StyleTransfer => 15,
            OperationKind::Avatar => 20,
            OperationKind::ResolutionImprove | OperationKind::RemoveBg => 5,
        }
    }

    pub fn requires_source_image(&self) -> bool {
        !matches!(self, OperationKind::Generate)
    }

    /// Environment-style suffix, e.g. `STYLE_TRANSFER`.
    pub fn env_suffix(&self) -> String {
        self.as_str().replace('-', "_").to_ascii_uppercase()
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OperationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown operation kind: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_parse_back() {
        for kind in OperationKind::ALL {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
        assert!("upscale".parse::<OperationKind>().is_err());
    }

    #[test]
    fn env_suffix_is_screaming_snake() {
        assert_eq!(OperationKind::StyleTransfer.env_suffix(), "STYLE_TRANSFER");
        assert_eq!(OperationKind::RemoveBg.env_suffix(), "REMOVE_BG");
    }
}
