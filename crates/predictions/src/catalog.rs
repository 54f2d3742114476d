//! Which provider model runs each operation, and what it costs.

use std::collections::BTreeMap;

use serde::Serialize;

use artforge_core::{DomainError, DomainResult};

use crate::kind::OperationKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    /// Provider model reference, `owner/name`.
    pub model: String,
    pub cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelCatalog {
    entries: BTreeMap<OperationKind, ModelSpec>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let entries = OperationKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    ModelSpec {
                        model: default_model(kind).to_string(),
                        cost: kind.default_cost(),
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

fn default_model(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Generate => "black-forest-labs/flux-schnell",
        OperationKind::Edit => "black-forest-labs/flux-kontext-pro",
        OperationKind::StyleTransfer => "black-forest-labs/flux-kontext-pro",
        OperationKind::Avatar => "flux-kontext-apps/professional-headshot",
        OperationKind::ResolutionImprove => "nightmareai/real-esrgan",
        OperationKind::RemoveBg => "lucataco/remove-bg",
    }
}

impl ModelCatalog {
    /// Defaults overridden by `MODEL_<KIND>` and `COST_<KIND>` keys.
    pub fn with_overrides(lookup: impl Fn(&str) -> Option<String>) -> DomainResult<Self> {
        let mut catalog = Self::default();
        for kind in OperationKind::ALL {
            let suffix = kind.env_suffix();
            let Some(spec) = catalog.entries.get_mut(&kind) else {
                continue;
            };
            if let Some(model) =
                lookup(&format!("MODEL_{suffix}")).filter(|m| !m.trim().is_empty())
            {
                spec.model = model.trim().to_string();
            }
            if let Some(cost) = lookup(&format!("COST_{suffix}")) {
                spec.cost = cost.trim().parse().map_err(|_| {
                    DomainError::validation(format!("COST_{suffix} must be a non-negative integer"))
                })?;
            }
        }
        Ok(catalog)
    }

    pub fn spec(&self, kind: OperationKind) -> DomainResult<&ModelSpec> {
        self.entries
            .get(&kind)
            .ok_or_else(|| DomainError::validation(format!("no model configured for {kind}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperationKind, &ModelSpec)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_cover_every_kind() {
        let c = ModelCatalog::default();
        for kind in OperationKind::ALL {
            assert_eq!(c.spec(kind).unwrap().cost, kind.default_cost());
        }
    }

    #[test]
    fn overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MODEL_STYLE_TRANSFER", "acme/stylize"),
            ("COST_GENERATE", "0"),
        ]
        .into_iter()
        .collect();
        let c = ModelCatalog::with_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.spec(OperationKind::StyleTransfer).unwrap().model, "acme/stylize");
        assert_eq!(c.spec(OperationKind::Generate).unwrap().cost, 0);

        let bad = ModelCatalog::with_overrides(|k| (k == "COST_EDIT").then(|| "-1".to_string()));
        assert!(bad.is_err());
    }
}
