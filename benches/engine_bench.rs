use std::path::Path;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use vre::caption::template_ids;
use vre::convert::convert;
use vre::engine::sample_data;
use vre::{CaptionGenerator, FsStore, OutputFormat, TemplateRegistry};

fn shipped_registry() -> TemplateRegistry {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
    TemplateRegistry::with_store(Arc::new(FsStore::open(root).expect("templates dir")))
}

fn bench_render_template(c: &mut Criterion) {
    let registry = shipped_registry();
    let data = sample_data(template_ids::STATUS_PEDIDO);
    // first call compiles and caches
    registry
        .render_template("default", template_ids::STATUS_PEDIDO, &data)
        .expect("render failed");

    c.bench_function("render_template_cached", |b| {
        b.iter(|| {
            let html = registry
                .render_template("default", template_ids::STATUS_PEDIDO, black_box(&data))
                .unwrap();
            black_box(html);
        })
    });
}

fn bench_generate_caption(c: &mut Criterion) {
    let captions = CaptionGenerator::new();
    let data = json!({
        "titulo": "Ofertas da semana",
        "produtos": (1..=8)
            .map(|i| json!({"nome": format!("Produto {}", i), "preco": 10.0 * i as f64, "unidade": "kg"}))
            .collect::<Vec<_>>(),
    });
    let data = data.as_object().cloned().unwrap_or_default();

    c.bench_function("generate_caption_list", |b| {
        b.iter(|| black_box(captions.generate(template_ids::LISTA_PRODUTOS, black_box(&data), "")))
    });
}

fn bench_convert(c: &mut Criterion) {
    let mut img = image::RgbaImage::new(800, 600);
    for (x, y, px) in img.enumerate_pixels_mut() {
        *px = image::Rgba([(x % 256) as u8, (y % 256) as u8, 96, 255]);
    }
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .expect("encode png");

    c.bench_function("convert_jpeg", |b| {
        b.iter(|| black_box(convert(black_box(&png), OutputFormat::Jpeg, 85, None).unwrap()))
    });
}

criterion_group!(benches, bench_render_template, bench_generate_caption, bench_convert);
criterion_main!(benches);
