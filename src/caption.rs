//! Caption generation
//!
//! Derives a plain-text, channel-safe caption from the same data that feeds a
//! template. Captions accompany the image as message text and serve as the
//! accessible description of the picture.
//!
//! Each template type registers its own handler; adding a template type means
//! registering one more handler, nothing else changes.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::funcs::{format_currency, num_emoji, num_emoji_count, stock_status, substr};
use crate::{Error, Result};

/// Data handed to a caption handler
pub type CaptionData = Map<String, Value>;

/// Builds a caption for one template type
pub type CaptionHandler = Arc<dyn Fn(&CaptionData) -> String + Send + Sync>;

/// Longest payment code copied into a caption
const PAYMENT_CODE_PREVIEW: usize = 50;

/// Template ids with a built-in caption handler
pub mod template_ids {
    pub const MENU_OPCOES: &str = "menu_opcoes";
    pub const CARD_PRODUTO: &str = "card_produto";
    pub const STATUS_PEDIDO: &str = "status_pedido";
    pub const LISTA_PRODUTOS: &str = "lista_produtos";
    pub const CONFIRMACAO: &str = "confirmacao";
    pub const COBRANCA_PIX: &str = "cobranca_pix";
}

/// Registered-handler caption generator.
#[derive(Clone)]
pub struct CaptionGenerator {
    handlers: HashMap<String, CaptionHandler>,
}

impl Default for CaptionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CaptionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().collect();
        ids.sort();
        f.debug_struct("CaptionGenerator").field("handlers", &ids).finish()
    }
}

impl CaptionGenerator {
    /// Generator with handlers for every built-in template type.
    pub fn new() -> Self {
        use template_ids::*;

        let mut gen = Self::empty();
        gen.register(MENU_OPCOES, menu_caption);
        gen.register(CARD_PRODUTO, product_caption);
        gen.register(STATUS_PEDIDO, status_caption);
        gen.register(LISTA_PRODUTOS, list_caption);
        gen.register(CONFIRMACAO, confirmation_caption);
        gen.register(COBRANCA_PIX, payment_caption);
        gen
    }

    /// Generator without any handler.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for a template type.
    pub fn register<F>(&mut self, template_id: impl Into<String>, handler: F)
    where
        F: Fn(&CaptionData) -> String + Send + Sync + 'static,
    {
        self.handlers.insert(template_id.into(), Arc::new(handler));
    }

    pub fn handles(&self, template_id: &str) -> bool {
        self.handlers.contains_key(template_id)
    }

    /// Caption for `template_id`.
    ///
    /// A non-empty `explicit` caption is returned verbatim. Unknown template
    /// ids yield an empty string.
    pub fn generate(&self, template_id: &str, data: &CaptionData, explicit: &str) -> String {
        if !explicit.is_empty() {
            return explicit.to_string();
        }
        match self.handlers.get(template_id) {
            Some(handler) => handler(data),
            None => String::new(),
        }
    }

    /// Like [`generate`](Self::generate) but from raw JSON.
    pub fn generate_from_json(&self, template_id: &str, json: &[u8], explicit: &str) -> Result<String> {
        let data: CaptionData = serde_json::from_slice(json)
            .map_err(|e| Error::InvalidRequest(format!("caption data is not a JSON object: {}", e)))?;
        Ok(self.generate(template_id, &data, explicit))
    }
}

fn text<'a>(data: &'a CaptionData, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn number(data: &CaptionData, key: &str) -> Option<f64> {
    data.get(key).and_then(Value::as_f64)
}

fn objects<'a>(data: &'a CaptionData, key: &str) -> impl Iterator<Item = &'a CaptionData> {
    data.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn menu_caption(data: &CaptionData) -> String {
    let mut out = String::new();
    if let Some(titulo) = text(data, "titulo") {
        out.push_str(titulo);
        out.push_str("\n\n");
    }
    for (i, opt) in objects(data, "opcoes").take(num_emoji_count()).enumerate() {
        out.push_str(&num_emoji(i as i64 + 1));
        out.push(' ');
        out.push_str(text(opt, "label").unwrap_or_default());
        out.push('\n');
    }
    out.push_str("\n_Responda com o número da opção_");
    out
}

fn product_caption(data: &CaptionData) -> String {
    let mut out = String::new();
    if let Some(nome) = text(data, "nome") {
        out.push_str(&format!("📦 {}\n", nome));
    }
    if let Some(preco) = number(data, "preco") {
        let unidade = text(data, "unidade").unwrap_or("un");
        out.push_str(&format!("💰 {}/{}\n", format_currency(preco), unidade));
    }
    if number(data, "estoque").is_some_and(|n| n > 0.0) {
        out.push_str("✅ Em estoque\n");
    } else if let Some(status) = text(data, "estoque_status") {
        out.push_str(stock_status(status));
        out.push('\n');
    }
    if let Some(mensagem) = text(data, "mensagem") {
        out.push('\n');
        out.push_str(mensagem);
    }
    out
}

fn order_status_label(code: &str) -> Option<&'static str> {
    match code {
        "recebido" => Some("📥 Recebido"),
        "separacao" => Some("📦 Em separação"),
        "faturado" => Some("🧾 Faturado"),
        "transporte" => Some("🚚 Em transporte"),
        "entregue" => Some("✅ Entregue"),
        _ => None,
    }
}

fn status_caption(data: &CaptionData) -> String {
    let mut out = String::new();
    if let Some(numero) = text(data, "numero_pedido") {
        out.push_str(&format!("📦 Pedido #{}\n", numero));
    }
    if let Some(label) = text(data, "status_atual").and_then(order_status_label) {
        out.push_str(&format!("📍 Status: {}\n", label));
    }
    if let Some(itens) = text(data, "itens_resumo") {
        out.push_str(&format!("📋 {}\n", itens));
    }
    if let Some(valor) = number(data, "valor_total").filter(|v| *v > 0.0) {
        out.push_str(&format!("💰 {}\n", format_currency(valor)));
    }
    if let Some(previsao) = text(data, "previsao_entrega") {
        out.push_str(&format!("🕐 Previsão: {}\n", previsao));
    }
    if let Some(transportadora) = text(data, "transportadora") {
        out.push_str(&format!("🏢 Transportadora: {}\n", transportadora));
    }
    if let Some(motorista) = text(data, "motorista") {
        out.push_str(&format!("🚛 Motorista: {}\n", motorista));
    }
    out
}

fn list_caption(data: &CaptionData) -> String {
    let mut out = String::new();
    if let Some(titulo) = text(data, "titulo") {
        out.push_str(titulo);
        out.push_str("\n\n");
    }
    for (i, prod) in objects(data, "produtos").take(num_emoji_count()).enumerate() {
        out.push_str(&num_emoji(i as i64 + 1));
        out.push(' ');
        out.push_str(text(prod, "nome").unwrap_or_default());
        if let Some(preco) = number(prod, "preco") {
            let unidade = text(prod, "unidade").unwrap_or("un");
            out.push_str(&format!(" — {}/{}", format_currency(preco), unidade));
        }
        out.push('\n');
    }
    if let Some(mensagem) = text(data, "mensagem") {
        out.push('\n');
        out.push_str(mensagem);
    }
    out
}

fn confirmation_caption(data: &CaptionData) -> String {
    let mut out = String::from("📋 Resumo do pedido:\n\n");
    for item in objects(data, "itens") {
        let emoji = text(item, "emoji").unwrap_or("•");
        let nome = text(item, "nome").unwrap_or_default();
        let preco = format_currency(number(item, "preco").unwrap_or(0.0));
        match text(item, "quantidade") {
            Some(qtd) => out.push_str(&format!("{} {} — {} — {}\n", emoji, nome, qtd, preco)),
            None => out.push_str(&format!("{} {} — {}\n", emoji, nome, preco)),
        }
    }
    if let Some(total) = number(data, "valor_total") {
        out.push_str(&format!("\n💰 Total: {}\n", format_currency(total)));
    }
    if let Some(previsao) = text(data, "previsao_entrega") {
        out.push_str(&format!("📅 Entrega: {}\n", previsao));
    }
    out.push_str("\n_Responda SIM para confirmar ou peça alterações_");
    out
}

fn payment_caption(data: &CaptionData) -> String {
    let mut out = String::from("◆ Pagamento via PIX\n\n");
    if let Some(numero) = text(data, "numero_pedido") {
        out.push_str(&format!("📋 Pedido #{}\n", numero));
    }
    if let Some(valor) = number(data, "valor") {
        out.push_str(&format!("💰 Valor: {}\n", format_currency(valor)));
    }
    if let Some(expiracao) = text(data, "expiracao") {
        out.push_str(&format!("⏱ Válido por {}\n", expiracao));
    }
    if let Some(payload) = text(data, "pix_payload") {
        out.push_str("\n📱 Código PIX copia e cola:\n");
        if payload.chars().count() > PAYMENT_CODE_PREVIEW {
            out.push_str(&substr(payload, 0, PAYMENT_CODE_PREVIEW));
            out.push_str("...");
        } else {
            out.push_str(payload);
        }
        out.push('\n');
    }
    out.push_str("\n_Assim que identificarmos o pagamento, te aviso aqui!_");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(v: Value) -> CaptionData {
        match v {
            Value::Object(m) => m,
            _ => panic!("test data must be an object"),
        }
    }

    fn in_order(haystack: &str, needles: &[&str]) -> bool {
        let mut rest = haystack;
        for n in needles {
            match rest.find(n) {
                Some(i) => rest = &rest[i + n.len()..],
                None => return false,
            }
        }
        true
    }

    #[test]
    fn explicit_caption_wins() {
        let gen = CaptionGenerator::new();
        let d = data(json!({"titulo": "ignored", "opcoes": [{"label": "x"}]}));
        assert_eq!(gen.generate("menu_opcoes", &d, "Custom caption"), "Custom caption");
        assert_eq!(gen.generate("unknown", &d, "Custom caption"), "Custom caption");
    }

    #[test]
    fn menu_lists_numbered_options_in_order() {
        let gen = CaptionGenerator::new();
        let d = data(json!({
            "titulo": "Como posso ajudar?",
            "opcoes": [{"label": "Fazer pedido"}, {"label": "Ver catálogo"}]
        }));
        let caption = gen.generate("menu_opcoes", &d, "");
        assert!(in_order(
            &caption,
            &["Como posso ajudar?", "1️⃣", "Fazer pedido", "2️⃣", "Ver catálogo"]
        ));
    }

    #[test]
    fn menu_stops_at_last_glyph() {
        let gen = CaptionGenerator::new();
        let opcoes: Vec<Value> = (1..=10).map(|i| json!({"label": format!("op{}", i)})).collect();
        let caption = gen.generate("menu_opcoes", &data(json!({"opcoes": opcoes})), "");
        assert!(caption.contains("op8"));
        assert!(!caption.contains("op9"));
    }

    #[test]
    fn product_card_uses_cent_rounded_currency() {
        let gen = CaptionGenerator::new();
        let d = data(json!({"nome": "Camarão Cinza", "preco": 62.90, "unidade": "kg", "estoque": 100}));
        let caption = gen.generate("card_produto", &d, "");
        assert!(caption.contains("Camarão Cinza"));
        assert!(caption.contains("R$ 62,90/kg"));
        assert!(caption.contains("Em estoque"));

        let no_stock = data(json!({"nome": "Produto", "preco": 10.0}));
        assert!(!gen.generate("card_produto", &no_stock, "").contains("Em estoque"));
    }

    #[test]
    fn order_status_maps_codes_and_appends_delivery() {
        let gen = CaptionGenerator::new();
        let d = data(json!({
            "numero_pedido": "1234",
            "status_atual": "transporte",
            "previsao_entrega": "Hoje, 18h",
            "motorista": "João S."
        }));
        let caption = gen.generate("status_pedido", &d, "");
        assert!(in_order(&caption, &["Pedido #1234", "Em transporte", "Hoje, 18h", "João S."]));

        let unknown = data(json!({"numero_pedido": "9", "status_atual": "perdido"}));
        assert!(!gen.generate("status_pedido", &unknown, "").contains("Status"));
    }

    #[test]
    fn confirmation_lists_items_and_total() {
        let gen = CaptionGenerator::new();
        let d = data(json!({
            "itens": [
                {"nome": "Item 1", "quantidade": "2 un", "preco": 59.8},
                {"nome": "Item 2", "preco": 35}
            ],
            "valor_total": 94.8
        }));
        let caption = gen.generate("confirmacao", &d, "");
        assert!(caption.contains("Resumo do pedido"));
        assert!(caption.contains("• Item 1 — 2 un — R$ 59,80"));
        assert!(caption.contains("• Item 2 — R$ 35,00"));
        assert!(caption.contains("Total: R$ 94,80"));
    }

    #[test]
    fn payment_code_is_truncated() {
        let gen = CaptionGenerator::new();
        let payload = "0002012658".repeat(10);
        let d = data(json!({"valor": 150.0, "pix_payload": payload}));
        let caption = gen.generate("cobranca_pix", &d, "");
        assert!(caption.contains("R$ 150,00"));
        assert!(caption.contains(&format!("{}...", &payload[..50])));
        assert!(!caption.contains(&payload));

        let short = data(json!({"pix_payload": "00020126580014br..."}));
        assert!(gen.generate("cobranca_pix", &short, "").contains("00020126580014br..."));
    }

    #[test]
    fn product_list_numbers_entries() {
        let gen = CaptionGenerator::new();
        let d = data(json!({
            "titulo": "Produtos disponíveis",
            "produtos": [{"nome": "Produto A", "preco": 29.9}, {"nome": "Produto B", "preco": 49.9, "unidade": "kg"}]
        }));
        let caption = gen.generate("lista_produtos", &d, "");
        assert!(in_order(&caption, &["Produtos disponíveis", "1️⃣ Produto A — R$ 29,90/un", "2️⃣ Produto B — R$ 49,90/kg"]));
    }

    #[test]
    fn unknown_template_is_empty_and_custom_handlers_register() {
        let mut gen = CaptionGenerator::new();
        assert_eq!(gen.generate("unknown", &CaptionData::new(), ""), "");
        assert!(!gen.handles("banner"));

        gen.register("banner", |d: &CaptionData| {
            format!("Banner: {}", d.get("texto").and_then(Value::as_str).unwrap_or("-"))
        });
        assert!(gen.handles("banner"));
        assert_eq!(gen.generate("banner", &data(json!({"texto": "Oferta"})), ""), "Banner: Oferta");
    }

    #[test]
    fn from_json_parses_objects_only() {
        let gen = CaptionGenerator::new();
        let caption = gen
            .generate_from_json("card_produto", br#"{"nome": "Polvo", "preco": 89.9}"#, "")
            .unwrap();
        assert!(caption.contains("R$ 89,90"));
        assert!(gen.generate_from_json("card_produto", b"[1, 2]", "").is_err());
    }
}
