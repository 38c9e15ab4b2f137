//! Tenant visual identity

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Owner tag of the shared default templates and brand
pub const DEFAULT_TENANT: &str = "default";

/// Visual identity of a tenant, handed to every template as `brand`.
///
/// Fields missing from a stored config are filled from the built-in default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrandConfig {
    pub tenant_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub primary_color: String,
    pub secondary_color: String,
    pub accent_color: String,
    pub background: String,
    pub text_color: String,
    pub muted_color: String,
    pub font_family: String,
    pub border_radius: String,
    /// icon name -> glyph
    pub icons: BTreeMap<String, String>,
}

impl Default for BrandConfig {
    fn default() -> Self {
        let icons = [
            ("pedido", "🛒"),
            ("catalogo", "📋"),
            ("entrega", "🚚"),
            ("financeiro", "💰"),
            ("atendente", "👤"),
            ("reclamacao", "📝"),
            ("devolucao", "↩️"),
            ("outro", "❓"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            tenant_id: DEFAULT_TENANT.to_string(),
            name: "Visual Response".to_string(),
            logo_url: None,
            primary_color: "#0F3460".to_string(),
            secondary_color: "#E94560".to_string(),
            accent_color: "#16C79A".to_string(),
            background: "#FFFFFF".to_string(),
            text_color: "#1A1A2E".to_string(),
            muted_color: "#8B95A2".to_string(),
            font_family: "'DM Sans', sans-serif".to_string(),
            border_radius: "14px".to_string(),
            icons,
        }
    }
}

impl BrandConfig {
    /// Built-in default tagged with `tenant_id`.
    pub fn default_for(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Self::default()
        }
    }

    /// Glyph for `name` from this brand's icon set.
    pub fn icon(&self, name: &str) -> Option<&str> {
        self.icons.get(name).map(String::as_str)
    }
}
