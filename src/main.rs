use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use vre::placeholder::PlaceholderFactory;
use vre::renderer::Surface;
use vre::{Channel, ContextFactory, OutputFormat, RenderRequest, RenderResponse, VisualResponseEngine, VreConfig};

#[derive(Parser, Debug)]
#[command(name = "vre", version, about = "Render chat visual responses from templates", long_about = None)]
struct Cli {
    /// Template store root (default/, tenants/<id>/)
    #[arg(long, env = "VRE_TEMPLATES_PATH")]
    templates: Option<PathBuf>,

    /// Rendering backend
    #[arg(long, value_enum, default_value_t = Backend::Chrome)]
    backend: Backend,

    /// Number of warm rendering contexts
    #[arg(long)]
    pool_size: Option<usize>,

    /// Chrome binary
    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Chrome,
    Placeholder,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a template (or raw HTML) to an image file
    Render {
        #[arg(long)]
        tenant: String,
        #[arg(long, required_unless_present = "html")]
        template: Option<String>,
        /// Raw HTML file rendered instead of a template
        #[arg(long, conflicts_with = "template")]
        html: Option<PathBuf>,
        /// JSON data, or @path to read it from a file
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        caption: Option<String>,
        /// Output image path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render a template with built-in sample data
    Preview {
        #[arg(long, default_value = "default")]
        tenant: String,
        #[arg(long)]
        template: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List the templates available to a tenant
    Templates {
        #[arg(long, default_value = "default")]
        tenant: String,
    },
    /// Print a tenant's brand config
    Brand {
        #[arg(long, default_value = "default")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = VreConfig::from_env().context("invalid VRE_* environment")?;
    if let Some(path) = &cli.templates {
        config.templates_path = path.clone();
    }
    if let Some(size) = cli.pool_size {
        config.pool_size = size;
    }
    if cli.chrome_path.is_some() {
        config.chrome_path = cli.chrome_path.clone();
    }
    // listing and brand lookups never render
    if matches!(cli.command, Command::Templates { .. } | Command::Brand { .. }) {
        config.pool_size = 1;
    }

    match cli.backend {
        Backend::Placeholder => {
            let engine = VisualResponseEngine::with_factory(config, PlaceholderFactory)?;
            run(engine, cli.command).await
        }
        #[cfg(feature = "cdp")]
        Backend::Chrome => {
            let engine = VisualResponseEngine::launch(config)?;
            run(engine, cli.command).await
        }
        #[cfg(not(feature = "cdp"))]
        Backend::Chrome => bail!("this build has no Chrome backend; use --backend placeholder"),
    }
}

async fn run<F>(engine: VisualResponseEngine<F>, command: Command) -> anyhow::Result<()>
where
    F: ContextFactory,
    F::Context: Surface,
{
    let result = execute(&engine, command).await;
    engine.close().await;
    result
}

async fn execute<F>(engine: &VisualResponseEngine<F>, command: Command) -> anyhow::Result<()>
where
    F: ContextFactory,
    F::Context: Surface,
{
    match command {
        Command::Render {
            tenant,
            template,
            html,
            data,
            channel,
            format,
            width,
            caption,
            output,
        } => {
            let mut request = match html {
                Some(path) => {
                    let html = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    RenderRequest::custom_html(tenant, html)
                }
                None => {
                    let template = template.unwrap_or_default();
                    RenderRequest::template(tenant, template, parse_data(&data)?)
                }
            };
            if let Some(channel) = channel {
                match Channel::parse(&channel) {
                    Some(c) => request = request.with_channel(c),
                    None => bail!("unknown channel: {}", channel),
                }
            }
            if let Some(format) = format {
                request = request.with_format(format.parse::<OutputFormat>()?);
            }
            if let Some(width) = width {
                request = request.with_width(width);
            }
            if let Some(caption) = caption {
                request = request.with_caption(caption);
            }

            let response = engine.render(&request).await?;
            write_output(&response, &output)
        }
        Command::Preview {
            tenant,
            template,
            output,
        } => {
            let response = engine.preview(&tenant, &template).await?;
            write_output(&response, &output)
        }
        Command::Templates { tenant } => {
            for id in engine.list_templates(&tenant)? {
                println!("{}", id);
            }
            Ok(())
        }
        Command::Brand { tenant } => {
            let brand = engine.brand_config(&tenant)?;
            println!("{}", serde_json::to_string_pretty(&*brand)?);
            Ok(())
        }
    }
}

fn parse_data(raw: &str) -> anyhow::Result<serde_json::Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("data is not valid JSON")
}

fn write_output(response: &RenderResponse, output: &Path) -> anyhow::Result<()> {
    std::fs::write(output, &response.image)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
