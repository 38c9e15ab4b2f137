//! Template function library
//!
//! A fixed set of pure helpers made available inside templates. Every helper
//! is deterministic and free of I/O; the library is built once, shared behind
//! an `Arc`, and installed into each template environment when a template is
//! parsed, so separate registries (and tests) never share mutable state.
//!
//! The plain Rust functions are public so captions and callers format values
//! exactly the way templates do.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use minijinja::value::{Rest, Value};
use minijinja::{Environment, Error as TemplateError, ErrorKind};

/// Version of the helper set exposed to templates. Bump when a helper is
/// added, removed or changes output.
pub const FUNCTION_LIBRARY_VERSION: u32 = 1;

/// Glyph used when an icon name is unknown
pub const FALLBACK_ICON: &str = "•";

const NUMBER_EMOJIS: [&str; 8] = ["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣"];

const DEFAULT_ICONS: &[(&str, &str)] = &[
    ("pedido", "🛒"),
    ("catalogo", "📋"),
    ("entrega", "🚚"),
    ("financeiro", "💰"),
    ("atendente", "👤"),
    ("reclamacao", "📝"),
    ("devolucao", "↩️"),
    ("outro", "❓"),
    ("produto", "📦"),
    ("status", "📍"),
    ("pix", "◆"),
    ("check", "✓"),
    ("confirm", "✅"),
    ("warning", "⚠️"),
    ("error", "❌"),
    ("info", "ℹ️"),
];

/// Immutable registry of template helpers.
#[derive(Debug, Clone)]
pub struct FunctionLibrary {
    icons: BTreeMap<&'static str, &'static str>,
}

impl Default for FunctionLibrary {
    fn default() -> Self {
        Self::standard()
    }
}

impl FunctionLibrary {
    /// The standard helper set.
    pub fn standard() -> Self {
        Self {
            icons: DEFAULT_ICONS.iter().copied().collect(),
        }
    }

    pub fn version(&self) -> u32 {
        FUNCTION_LIBRARY_VERSION
    }

    /// Glyph for an icon name, or [`FALLBACK_ICON`].
    pub fn icon(&self, name: &str) -> &'static str {
        self.icons.get(name).copied().unwrap_or(FALLBACK_ICON)
    }

    /// Register every helper as a global function of `env`.
    pub fn install(self: &Arc<Self>, env: &mut Environment<'static>) {
        // index arithmetic
        env.add_function("add", |a: i64, b: i64| checked("add", a.checked_add(b)));
        env.add_function("sub", |a: i64, b: i64| checked("sub", a.checked_sub(b)));
        env.add_function("mul", |a: i64, b: i64| checked("mul", a.checked_mul(b)));

        let lib = Arc::clone(self);
        env.add_function("icon", move |name: Option<&str>| {
            lib.icon(name.unwrap_or_default()).to_string()
        });
        env.add_function("num_emoji", |n: i64| num_emoji(n));

        env.add_function("format_currency", |v: Value| match value_as_f64(&v) {
            Some(n) => format_currency(n),
            None => INVALID_CURRENCY.to_string(),
        });
        env.add_function("format_date", |v: Value| format_date(&TimeInput::from(&v)));
        env.add_function("format_datetime", |v: Value| {
            format_datetime(&TimeInput::from(&v))
        });
        env.add_function("format_unit", |unit: Option<&str>| {
            format_unit(unit.unwrap_or_default())
        });

        env.add_function("stock_status", |s: Option<&str>| {
            stock_status(s.unwrap_or_default()).to_string()
        });
        env.add_function("stock_class", |s: Option<&str>| {
            stock_class(s.unwrap_or_default()).to_string()
        });
        env.add_function("step_class", |s: Option<&str>| {
            step_class(s.unwrap_or_default()).to_string()
        });

        env.add_function("truncate", |s: Option<&str>, n: usize| {
            truncate(s.unwrap_or_default(), n)
        });
        env.add_function("substr", |s: Option<&str>, start: usize, len: usize| {
            substr(s.unwrap_or_default(), start, len)
        });
        env.add_function("with_alpha", |color: &str, alpha: u32| with_alpha(color, alpha));
        env.add_function("safe_html", |s: Option<&str>| {
            Value::from_safe_string(s.unwrap_or_default().to_string())
        });
        env.add_function("ifelse", |cond: bool, yes: Value, no: Value| {
            if cond {
                yes
            } else {
                no
            }
        });

        // collection helpers
        env.add_function("list", |items: Rest<Value>| Value::from(items.0));
        env.add_function("dict", |args: Rest<Value>| {
            let mut map = BTreeMap::new();
            for pair in args.0.chunks(2) {
                if let [k, v] = pair {
                    if let Some(key) = k.as_str() {
                        map.insert(key.to_string(), v.clone());
                    }
                }
            }
            Value::from(map)
        });
        env.add_function("index", |collection: Value, key: Value| {
            collection.get_item(&key).unwrap_or(Value::UNDEFINED)
        });
        env.add_function("len", |v: Value| v.len().unwrap_or(0));
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    if v.is_number() {
        f64::try_from(v.clone()).ok()
    } else {
        None
    }
}

/// Output for values that are not numbers
pub const INVALID_CURRENCY: &str = "R$ --";

/// Brazilian Real formatting: `R$ 1.234,56`.
///
/// The value is rounded to the nearest cent (half away from zero) before any
/// digit is produced.
pub fn format_currency(value: f64) -> String {
    if !value.is_finite() {
        return INVALID_CURRENCY.to_string();
    }
    let cents = (value * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!(
        "{}R$ {},{:02}",
        sign,
        with_thousands(cents / 100),
        cents % 100
    )
}

/// `1234567` -> `1.234.567`
pub fn with_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    out
}

/// Accepted encodings for date helpers
#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput<'a> {
    /// Unix timestamp in seconds
    Unix(i64),
    /// Textual date, parsed leniently
    Text(&'a str),
    Missing,
}

impl<'a> From<&'a Value> for TimeInput<'a> {
    fn from(v: &'a Value) -> Self {
        if let Some(s) = v.as_str() {
            TimeInput::Text(s)
        } else if v.is_number() {
            i64::try_from(v.clone())
                .map(TimeInput::Unix)
                .unwrap_or(TimeInput::Missing)
        } else {
            TimeInput::Missing
        }
    }
}

fn parse_time(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%d/%m/%Y %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(dt);
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(input, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn format_time(input: &TimeInput<'_>, fmt: &str) -> String {
    match input {
        TimeInput::Unix(secs) => DateTime::from_timestamp(*secs, 0)
            .map(|dt| dt.naive_utc().format(fmt).to_string())
            .unwrap_or_default(),
        TimeInput::Text(s) => match parse_time(s) {
            Some(dt) => dt.format(fmt).to_string(),
            None => s.to_string(),
        },
        TimeInput::Missing => String::new(),
    }
}

/// `dd/mm/yyyy`; unparseable text is returned unchanged.
pub fn format_date(input: &TimeInput<'_>) -> String {
    format_time(input, "%d/%m/%Y")
}

/// `dd/mm/yyyy HH:MM`; unparseable text is returned unchanged.
pub fn format_datetime(input: &TimeInput<'_>) -> String {
    format_time(input, "%d/%m/%Y %H:%M")
}

pub fn stock_status(status: &str) -> &str {
    match status {
        "disponivel" => "✓ Em estoque",
        "baixo" => "⚠ Estoque baixo",
        "indisponivel" => "✗ Indisponível",
        other => other,
    }
}

pub fn stock_class(status: &str) -> &'static str {
    match status {
        "disponivel" => "stock-ok",
        "baixo" => "stock-low",
        "indisponivel" => "stock-out",
        _ => "",
    }
}

pub fn step_class(status: &str) -> &'static str {
    match status {
        "done" => "step-icon done",
        "active" => "step-icon active",
        "wait" => "step-icon wait",
        _ => "step-icon",
    }
}

fn checked(op: &str, result: Option<i64>) -> Result<i64, TemplateError> {
    result.ok_or_else(|| TemplateError::new(ErrorKind::InvalidOperation, format!("{} overflowed", op)))
}

/// Keycap glyph for 1..=8, the plain number otherwise.
pub fn num_emoji(n: i64) -> String {
    match usize::try_from(n) {
        Ok(i) if (1..=NUMBER_EMOJIS.len()).contains(&i) => NUMBER_EMOJIS[i - 1].to_string(),
        _ => n.to_string(),
    }
}

/// Number of positions [`num_emoji`] has a glyph for.
pub fn num_emoji_count() -> usize {
    NUMBER_EMOJIS.len()
}

/// Shorten to at most `max` characters, ending in `...` when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let mut out: String = s.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

/// Character-based substring, clamped to the input.
pub fn substr(s: &str, start: usize, len: usize) -> String {
    s.chars().skip(start).take(len).collect()
}

/// `kg` -> `/kg`, `pc` -> `/pç`
pub fn format_unit(unit: &str) -> String {
    match unit {
        "pc" => "/pç".to_string(),
        other => format!("/{}", other),
    }
}

/// Append an alpha channel (0-100 %) to a `#RRGGBB` colour.
pub fn with_alpha(hex_color: &str, alpha: u32) -> String {
    let alpha = alpha.min(100) * 255 / 100;
    format!("{}{:02X}", hex_color, alpha)
}
