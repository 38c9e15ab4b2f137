//! The render entry point
//!
//! [`VisualResponseEngine`] ties the registry, renderer, caption generator and
//! render cache together: request in, image bytes plus caption out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::brand::{BrandConfig, DEFAULT_TENANT};
use crate::cache::RenderCache;
use crate::caption::{template_ids, CaptionGenerator};
use crate::pool::{BrowserPool, ContextFactory, PoolStats};
use crate::registry::{normalize_data, TemplateRegistry};
use crate::renderer::{RenderOpts, RenderedImage, Renderer, RendererConfig, Surface};
use crate::store::{FsStore, TemplateStore};
use crate::{Channel, ChannelDefaults, Error, RenderRequest, RenderResponse, Result, VreConfig};

/// Visual response engine over a rendering backend `F`
pub struct VisualResponseEngine<F: ContextFactory>
where
    F::Context: Surface,
{
    registry: Arc<TemplateRegistry>,
    renderer: Renderer<F>,
    captions: Arc<CaptionGenerator>,
    cache: RenderCache,
    fallback: ChannelDefaults,
}

#[cfg(feature = "cdp")]
impl VisualResponseEngine<crate::cdp::ChromeContextFactory> {
    /// Launch headless Chrome and warm the pool.
    pub fn launch(config: VreConfig) -> Result<Self> {
        config.validate()?;
        let factory = crate::cdp::ChromeContextFactory::launch(crate::cdp::ChromeOptions::from(&config))?;
        Self::with_factory(config, factory)
    }
}

impl<F: ContextFactory> VisualResponseEngine<F>
where
    F::Context: Surface,
{
    /// Engine reading templates from `config.templates_path`.
    pub fn with_factory(config: VreConfig, factory: F) -> Result<Self> {
        let store = FsStore::open(&config.templates_path)?;
        Self::from_parts(&config, Arc::new(store), factory)
    }

    /// Engine over an arbitrary template store.
    pub fn from_parts(config: &VreConfig, store: Arc<dyn TemplateStore>, factory: F) -> Result<Self> {
        config.validate()?;
        let pool = BrowserPool::new(
            factory,
            config.pool_size,
            Duration::from_millis(config.acquire_wait_ms),
        )?;

        Ok(Self {
            registry: Arc::new(TemplateRegistry::with_store(store)),
            renderer: Renderer::new(pool, RendererConfig::from(config)),
            captions: Arc::new(CaptionGenerator::new()),
            cache: RenderCache::new(Duration::from_millis(config.render_cache_ttl_ms)),
            fallback: config.fallback_channel_defaults(),
        })
    }

    /// Replace the caption generator, e.g. one with extra handlers registered.
    pub fn with_caption_generator(mut self, captions: CaptionGenerator) -> Self {
        self.captions = Arc::new(captions);
        self
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn captions(&self) -> &CaptionGenerator {
        &self.captions
    }

    pub async fn render(&self, request: &RenderRequest) -> Result<RenderResponse> {
        self.render_with_cancel(request, &CancellationToken::new()).await
    }

    /// Render a request; `cancel` aborts the wait for a rendering context.
    pub async fn render_with_cancel(
        &self,
        request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<RenderResponse> {
        let started = Instant::now();
        request.validate()?;
        let settings = request.settings(&self.fallback);

        let (key, data) = match &request.html {
            Some(html) if request.is_custom_html() => (
                RenderCache::key(&request.tenant_id, "", html.as_bytes(), &settings),
                None,
            ),
            _ => {
                let data = normalize_data(&request.data)?;
                let payload = serde_json::to_vec(&data)
                    .map_err(|e| Error::InvalidRequest(format!("render data is not serializable: {}", e)))?;
                (
                    RenderCache::key(&request.tenant_id, &request.template_id, &payload, &settings),
                    Some(data),
                )
            }
        };

        let (image, cache_hit) = match self.cache.get(&key) {
            Some(image) => (image, true),
            None => {
                // read before the template is resolved
                let generation = self.cache.generation();
                let image = self.render_uncached(request, data.as_ref(), &settings, cancel).await?;
                self.cache.insert(key, image.clone(), generation);
                (image, false)
            }
        };

        let caption = self.caption_for(request, data.as_ref());
        Ok(RenderResponse {
            format: image.format,
            width: image.width,
            height: image.height,
            image: image.bytes,
            caption,
            follow_up: request.follow_up.clone(),
            render_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            cache_hit,
        })
    }

    async fn render_uncached(
        &self,
        request: &RenderRequest,
        data: Option<&Map<String, Value>>,
        settings: &ChannelDefaults,
        cancel: &CancellationToken,
    ) -> Result<RenderedImage> {
        let html = match (data, &request.html) {
            (Some(data), _) => {
                self.registry
                    .render_template(&request.tenant_id, &request.template_id, data)?
            }
            (None, Some(html)) => html.clone(),
            (None, None) => {
                return Err(Error::InvalidRequest("nothing to render".into()));
            }
        };

        let opts = RenderOpts {
            width: settings.width,
            format: Some(settings.format),
            quality: settings.quality,
            scale: settings.scale,
            max_height: settings.max_height,
        };
        self.renderer.render_html(&html, &opts, cancel).await
    }

    fn caption_for(&self, request: &RenderRequest, data: Option<&Map<String, Value>>) -> String {
        let explicit = request.caption.as_deref().unwrap_or_default();
        match data {
            Some(data) => self.captions.generate(&request.template_id, data, explicit),
            None => explicit.to_string(),
        }
    }

    /// Render a template with built-in sample data.
    pub async fn preview(&self, tenant_id: &str, template_id: &str) -> Result<RenderResponse> {
        let request = RenderRequest::template(tenant_id, template_id, sample_data(template_id))
            .with_channel(Channel::Whatsapp);
        self.render(&request).await
    }

    pub fn list_templates(&self, tenant_id: &str) -> Result<Vec<String>> {
        self.registry.list_templates(tenant_id)
    }

    pub fn brand_config(&self, tenant_id: &str) -> Result<Arc<BrandConfig>> {
        self.registry.get_brand_config(tenant_id)
    }

    /// Save a tenant override; for [`DEFAULT_TENANT`] the shared default.
    pub fn save_template(&self, tenant_id: &str, template_id: &str, source: &str) -> Result<()> {
        self.registry.save_template(tenant_id, template_id, source)?;
        if tenant_id == DEFAULT_TENANT {
            self.cache.clear();
        } else {
            self.cache.invalidate_tenant(tenant_id);
        }
        Ok(())
    }

    pub fn save_brand_config(&self, tenant_id: &str, config: &BrandConfig) -> Result<()> {
        self.registry.save_brand_config(tenant_id, config)?;
        self.cache.invalidate_tenant(tenant_id);
        Ok(())
    }

    /// Drop a tenant's cached templates, brand config and renders.
    pub fn invalidate_cache(&self, tenant_id: &str) {
        self.registry.invalidate_cache(tenant_id);
        self.cache.invalidate_tenant(tenant_id);
        debug!("Invalidated caches for tenant {}", tenant_id);
    }

    pub fn invalidate_all(&self) {
        self.registry.invalidate_all();
        self.cache.clear();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.renderer.pool().stats()
    }

    /// Close the pool; later renders fail with `PoolClosed`.
    pub async fn close(&self) {
        self.renderer.pool().close().await;
    }
}

/// Example data for the shipped template types; empty for anything else.
pub fn sample_data(template_id: &str) -> Value {
    match template_id {
        template_ids::MENU_OPCOES => json!({
            "titulo": "Como posso ajudar?",
            "opcoes": [
                {"label": "Fazer pedido", "descricao": "Monte seu pedido", "icone": "pedido"},
                {"label": "Status do pedido", "descricao": "Rastreie sua entrega", "icone": "entrega"},
                {"label": "Ver catálogo", "descricao": "Conheça nossos produtos", "icone": "catalogo"},
            ],
        }),
        template_ids::CARD_PRODUTO => json!({
            "nome": "Produto Exemplo",
            "sku": "SKU-12345",
            "preco": 99.90,
            "unidade": "un",
            "estoque": 100,
            "destaque": "novo",
        }),
        template_ids::STATUS_PEDIDO => json!({
            "numero_pedido": "1234",
            "status_atual": "transporte",
            "itens_resumo": "5 produtos",
            "valor_total": 250.00,
            "previsao_entrega": "Hoje, 18h",
            "motorista": "João S.",
        }),
        template_ids::LISTA_PRODUTOS => json!({
            "titulo": "Produtos Disponíveis",
            "produtos": [
                {"nome": "Produto A", "preco": 29.90, "unidade": "un", "estoque_status": "disponivel"},
                {"nome": "Produto B", "preco": 49.90, "unidade": "kg", "estoque_status": "baixo"},
                {"nome": "Produto C", "preco": 19.90, "unidade": "un", "estoque_status": "disponivel"},
            ],
        }),
        template_ids::CONFIRMACAO => json!({
            "titulo": "Confirmar Pedido?",
            "previsao_entrega": "Amanhã",
            "itens": [
                {"nome": "Item 1", "quantidade": "2 un", "preco": 59.80},
                {"nome": "Item 2", "quantidade": "1 kg", "preco": 35.00},
            ],
            "valor_total": 94.80,
        }),
        template_ids::COBRANCA_PIX => json!({
            "valor": 150.00,
            "numero_pedido": "5678",
            "pix_payload": "00020126580014br.gov.bcb.pix0136example1234567890520400005303986",
            "expiracao": "30 minutos",
        }),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::PlaceholderFactory;
    use crate::store::MemoryStore;
    use crate::OutputFormat;

    fn engine(store: MemoryStore) -> VisualResponseEngine<PlaceholderFactory> {
        let config = VreConfig {
            pool_size: 1,
            acquire_wait_ms: 50,
            settle_delay_ms: 0,
            pngquant_path: None,
            ..VreConfig::default()
        };
        VisualResponseEngine::from_parts(&config, Arc::new(store), PlaceholderFactory).unwrap()
    }

    #[test]
    fn sample_data_covers_shipped_templates() {
        for id in [
            template_ids::MENU_OPCOES,
            template_ids::CARD_PRODUTO,
            template_ids::STATUS_PEDIDO,
            template_ids::LISTA_PRODUTOS,
            template_ids::CONFIRMACAO,
            template_ids::COBRANCA_PIX,
        ] {
            assert!(!sample_data(id).as_object().unwrap().is_empty(), "{}", id);
        }
        assert_eq!(sample_data("unknown"), json!({}));
    }

    #[tokio::test]
    async fn explicit_caption_and_follow_up_pass_through() {
        let engine = engine(MemoryStore::new().with("default/card_produto.html", "<div><p>{{ data.nome }}</p></div>"));
        let request = RenderRequest::template("acme", "card_produto", json!({"nome": "Tilápia", "preco": 40}))
            .with_caption("Confira!")
            .with_follow_up("Quer adicionar ao carrinho?")
            .with_format(OutputFormat::Png);

        let response = engine.render(&request).await.unwrap();
        assert_eq!(response.caption, "Confira!");
        assert_eq!(response.follow_up.as_deref(), Some("Quer adicionar ao carrinho?"));
        assert_eq!(response.format, OutputFormat::Png);
        assert!(!response.cache_hit);
        engine.close().await;
    }

    #[tokio::test]
    async fn template_saved_mid_render_is_not_shadowed_by_cache() {
        let store = MemoryStore::new().with("default/card_produto.html", "<div><p>{{ data.nome }}</p></div>");
        let config = VreConfig {
            pool_size: 1,
            acquire_wait_ms: 50,
            settle_delay_ms: 300,
            pngquant_path: None,
            ..VreConfig::default()
        };
        let engine = VisualResponseEngine::from_parts(&config, Arc::new(store), PlaceholderFactory).unwrap();
        let request = RenderRequest::template("acme", "card_produto", json!({"nome": "Tilápia"}))
            .with_format(OutputFormat::Png);

        let tall: String = (0..60).map(|i| format!("<p>linha {}</p>", i)).collect();
        let (first, saved) = tokio::join!(engine.render(&request), async {
            // lands while the first render is settling
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.save_template("acme", "card_produto", &format!("<div>{{{{ data.nome }}}}</div>{}", tall))
        });
        let first = first.unwrap();
        saved.unwrap();
        assert!(!first.cache_hit);

        let second = engine.render(&request).await.unwrap();
        assert!(!second.cache_hit);
        assert!(second.height > first.height);

        // the post-save render was cached normally
        assert!(engine.render(&request).await.unwrap().cache_hit);
        engine.close().await;
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let engine = engine(MemoryStore::new());
        let err = engine
            .render(&RenderRequest::template("acme", "nope", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn closed_engine_refuses_renders() {
        let engine = engine(MemoryStore::new());
        engine.close().await;
        let err = engine
            .render(&RenderRequest::custom_html("acme", "<p>x</p>"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }
}
