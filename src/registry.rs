//! Template registry
//!
//! Resolves `(tenant, template)` to a parsed template, tenant override first
//! and shared default second, and caches the result together with each
//! tenant's [`BrandConfig`]. Storage is only ever touched outside the cache
//! lock; loaded entries are inserted afterwards, and only if no invalidation
//! happened in between.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};
use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::brand::{BrandConfig, DEFAULT_TENANT};
use crate::funcs::FunctionLibrary;
use crate::store::TemplateStore;
use crate::{Error, Result};

const TEMPLATE_EXT: &str = ".html";
const BRAND_CONFIG_FILE: &str = "config.json";

/// Where a resolved template was loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOrigin {
    Tenant(String),
    Default,
}

/// A parsed template, ready to execute.
///
/// Each template owns its environment so that execution never touches the
/// registry's shared state.
pub struct ResolvedTemplate {
    env: Environment<'static>,
    template_id: String,
    origin: TemplateOrigin,
}

impl std::fmt::Debug for ResolvedTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedTemplate")
            .field("template_id", &self.template_id)
            .field("origin", &self.origin)
            .finish()
    }
}

impl ResolvedTemplate {
    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn origin(&self) -> &TemplateOrigin {
        &self.origin
    }

    /// Execute against an arbitrary serializable context.
    pub fn render<S: Serialize>(&self, ctx: S) -> Result<String> {
        let tmpl = self.env.get_template(&template_file(&self.template_id))?;
        Ok(tmpl.render(ctx)?)
    }
}

#[derive(Default)]
struct CacheState {
    templates: HashMap<String, Arc<ResolvedTemplate>>,
    brands: HashMap<String, Arc<BrandConfig>>,
    /// bumped on every invalidation
    generation: u64,
}

/// Tenant-aware template and brand-config cache over a [`TemplateStore`]
pub struct TemplateRegistry {
    store: Arc<dyn TemplateStore>,
    funcs: Arc<FunctionLibrary>,
    cache: RwLock<CacheState>,
}

impl TemplateRegistry {
    pub fn new(store: Arc<dyn TemplateStore>, funcs: Arc<FunctionLibrary>) -> Self {
        Self {
            store,
            funcs,
            cache: RwLock::new(CacheState::default()),
        }
    }

    /// Registry with the standard function library.
    pub fn with_store(store: Arc<dyn TemplateStore>) -> Self {
        Self::new(store, Arc::new(FunctionLibrary::standard()))
    }

    pub fn functions(&self) -> &Arc<FunctionLibrary> {
        &self.funcs
    }

    /// Resolve a template, tenant override first.
    pub fn resolve(&self, tenant_id: &str, template_id: &str) -> Result<Arc<ResolvedTemplate>> {
        validate_identifier("tenant id", tenant_id)?;
        validate_identifier("template id", template_id)?;

        let key = cache_key(tenant_id, template_id);
        let generation = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = cache.templates.get(&key) {
                debug!("Template cache hit: {}", key);
                return Ok(Arc::clone(hit));
            }
            cache.generation
        };
        debug!("Template cache miss: {}", key);

        let (source, origin) = self.load_source(tenant_id, template_id)?;
        let resolved = Arc::new(self.compile(template_id, source, origin)?);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation == generation {
            let entry = cache.templates.entry(key).or_insert(resolved);
            return Ok(Arc::clone(entry));
        }
        Ok(resolved)
    }

    /// Brand config for a tenant, the built-in default when none is stored.
    pub fn get_brand_config(&self, tenant_id: &str) -> Result<Arc<BrandConfig>> {
        validate_identifier("tenant id", tenant_id)?;

        let generation = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = cache.brands.get(tenant_id) {
                return Ok(Arc::clone(hit));
            }
            cache.generation
        };

        let brand = Arc::new(self.load_brand(tenant_id)?);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation == generation {
            let entry = cache.brands.entry(tenant_id.to_string()).or_insert(brand);
            return Ok(Arc::clone(entry));
        }
        Ok(brand)
    }

    /// Execute a template with `{brand, data}` for the tenant.
    ///
    /// `data` is converted structurally to a map; `null` counts as empty.
    pub fn render_template<T>(&self, tenant_id: &str, template_id: &str, data: &T) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        let data = normalize_data(data)?;
        let template = self.resolve(tenant_id, template_id)?;
        let brand = self.get_brand_config(tenant_id)?;
        template.render(context! { brand => &*brand, data => &data })
    }

    /// Drop every cached entry of one tenant.
    pub fn invalidate_cache(&self, tenant_id: &str) {
        let prefix = format!("{}:", tenant_id);
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.templates.retain(|key, _| !key.starts_with(&prefix));
        cache.brands.remove(tenant_id);
        cache.generation += 1;
        debug!("Invalidated template cache for tenant {}", tenant_id);
    }

    pub fn invalidate_all(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.templates.clear();
        cache.brands.clear();
        cache.generation += 1;
        debug!("Invalidated template cache");
    }

    /// Validate and persist a tenant template override.
    ///
    /// Saving for [`DEFAULT_TENANT`] replaces the shared default, which every
    /// tenant without an override falls back to, so all caches are dropped.
    pub fn save_template(&self, tenant_id: &str, template_id: &str, source: &str) -> Result<()> {
        validate_identifier("tenant id", tenant_id)?;
        validate_identifier("template id", template_id)?;

        let (key, origin) = if tenant_id == DEFAULT_TENANT {
            (default_template_key(template_id), TemplateOrigin::Default)
        } else {
            (
                tenant_template_key(tenant_id, template_id),
                TemplateOrigin::Tenant(tenant_id.to_string()),
            )
        };
        self.compile(template_id, source.to_string(), origin)?;
        self.store.write(&key, source.as_bytes())?;
        if tenant_id == DEFAULT_TENANT {
            self.invalidate_all();
        } else {
            self.invalidate_cache(tenant_id);
        }
        Ok(())
    }

    /// Persist a tenant's brand config.
    pub fn save_brand_config(&self, tenant_id: &str, config: &BrandConfig) -> Result<()> {
        validate_identifier("tenant id", tenant_id)?;

        let mut config = config.clone();
        config.tenant_id = tenant_id.to_string();
        let bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| Error::InvalidRequest(format!("invalid brand config: {}", e)))?;
        self.store.write(&brand_config_key(tenant_id), &bytes)?;
        self.invalidate_cache(tenant_id);
        Ok(())
    }

    /// Sorted union of default and tenant template ids.
    pub fn list_templates(&self, tenant_id: &str) -> Result<Vec<String>> {
        validate_identifier("tenant id", tenant_id)?;

        let mut ids = BTreeSet::new();
        for dir in [DEFAULT_TENANT.to_string(), format!("tenants/{}", tenant_id)] {
            for name in self.store.list(&dir)? {
                if let Some(id) = name.strip_suffix(TEMPLATE_EXT) {
                    if is_identifier(id) {
                        ids.insert(id.to_string());
                    }
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    fn load_source(&self, tenant_id: &str, template_id: &str) -> Result<(String, TemplateOrigin)> {
        if tenant_id != DEFAULT_TENANT {
            if let Some(bytes) = self.store.read(&tenant_template_key(tenant_id, template_id))? {
                return Ok((into_source(bytes)?, TemplateOrigin::Tenant(tenant_id.to_string())));
            }
        }
        if let Some(bytes) = self.store.read(&default_template_key(template_id))? {
            return Ok((into_source(bytes)?, TemplateOrigin::Default));
        }
        Err(Error::TemplateNotFound {
            tenant_id: tenant_id.to_string(),
            template_id: template_id.to_string(),
        })
    }

    fn load_brand(&self, tenant_id: &str) -> Result<BrandConfig> {
        let Some(bytes) = self.store.read(&brand_config_key(tenant_id))? else {
            return Ok(BrandConfig::default_for(tenant_id));
        };
        match serde_json::from_slice::<BrandConfig>(&bytes) {
            Ok(mut config) => {
                config.tenant_id = tenant_id.to_string();
                Ok(config)
            }
            Err(e) => {
                warn!("Unreadable brand config for tenant {}, using default: {}", tenant_id, e);
                Ok(BrandConfig::default_for(tenant_id))
            }
        }
    }

    fn compile(&self, template_id: &str, source: String, origin: TemplateOrigin) -> Result<ResolvedTemplate> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        self.funcs.install(&mut env);
        env.add_template_owned(template_file(template_id), source)?;
        Ok(ResolvedTemplate {
            env,
            template_id: template_id.to_string(),
            origin,
        })
    }
}

/// Whether `id` is a non-empty run of ASCII letters, digits, `-` and `_`.
pub fn is_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub(crate) fn validate_identifier(what: &str, id: &str) -> Result<()> {
    if is_identifier(id) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid {}: {:?}", what, id)))
    }
}

/// Structural conversion of render data into a map.
pub fn normalize_data<T: Serialize + ?Sized>(data: &T) -> Result<Map<String, Value>> {
    let value = serde_json::to_value(data)
        .map_err(|e| Error::InvalidRequest(format!("render data is not serializable: {}", e)))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(Error::InvalidRequest(format!(
            "render data must be an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn into_source(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::TemplateParse(format!("template is not UTF-8: {}", e)))
}

fn cache_key(tenant_id: &str, template_id: &str) -> String {
    format!("{}:{}", tenant_id, template_id)
}

fn template_file(template_id: &str) -> String {
    format!("{}{}", template_id, TEMPLATE_EXT)
}

fn default_template_key(template_id: &str) -> String {
    format!("{}/{}", DEFAULT_TENANT, template_file(template_id))
}

fn tenant_template_key(tenant_id: &str, template_id: &str) -> String {
    format!("tenants/{}/{}", tenant_id, template_file(template_id))
}

fn brand_config_key(tenant_id: &str) -> String {
    format!("tenants/{}/{}", tenant_id, BRAND_CONFIG_FILE)
}
