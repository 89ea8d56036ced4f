use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use xattn::heuristics::{estimated_block_count, may_have_perf_gain, multi_block_count};
use xattn::launch::plan_geometry;
use xattn::registry::{FunctionInfo, KernelFamily, LaunchStrategy};
use xattn::{AttentionRequest, Catalog, DataType, DispatchConfig, SmVersion, VariantKey};
use xattn_driver::{CudaDriver, Driver, FunctionHandle};

#[derive(Parser)]
#[command(
    name = "xattn",
    about = "Precompiled attention kernel dispatcher",
    long_about = "Inspect the kernel catalog and the selection the dispatcher would make.\n\nSet RUST_LOG=xattn=debug for registry and launch logs.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the current CUDA device
    Info,
    /// List catalog entries
    Catalog {
        /// Manifest directory or catalog.json (defaults to the linked kernel tables)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Only entries for this architecture, e.g. sm90
        #[arg(long)]
        arch: Option<SmVersion>,
        /// Only entries for this activation type
        #[arg(long)]
        dtype: Option<DataType>,
    },
    /// Report the variant key, gate and launch geometry for a request, without a GPU
    Select {
        /// Manifest directory or catalog.json (defaults to the linked kernel tables)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Request description (JSON, unset fields take defaults)
        #[arg(long)]
        request: PathBuf,
        /// Target architecture
        #[arg(long, default_value = "sm90")]
        arch: SmVersion,
        /// Multiprocessor count of the target device
        #[arg(long, default_value = "132")]
        sms: u32,
        /// Activation type
        #[arg(long, default_value = "fp16")]
        dtype: DataType,
        /// Dispatcher configuration (JSON); XATTN_* variables are applied on top
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Catalog { manifest, arch, dtype } => cmd_catalog(manifest.as_deref(), arch, dtype),
        Commands::Select { manifest, request, arch, sms, dtype, config } => {
            cmd_select(manifest.as_deref(), &request, arch, sms, dtype, config.as_deref())
        }
    }
}

fn load_catalog(manifest: Option<&Path>) -> anyhow::Result<Catalog> {
    match manifest {
        Some(path) => Catalog::from_manifest(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(Catalog::linked()),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DispatchConfig> {
    let mut config = match path {
        Some(path) => {
            DispatchConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => DispatchConfig::default(),
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    Ok(config)
}

fn cmd_info() -> anyhow::Result<()> {
    println!("xattn v{}", env!("CARGO_PKG_VERSION"));
    let driver: Arc<CudaDriver> = match CudaDriver::shared() {
        Ok(driver) => driver,
        Err(err) => {
            println!("  CUDA driver: not available ({})", err);
            return Ok(());
        }
    };
    let device = driver.current_device()?;
    let (major, minor) = driver.compute_capability(device)?;
    let sms = driver.multiprocessor_count(device)?;
    println!("  Device:     {}", device);
    println!("  Capability: {}.{} ({})", major, minor, SmVersion::from_capability(major, minor));
    println!("  SMs:        {}", sms);

    let catalog = Catalog::linked();
    let arch = SmVersion::from_capability(major, minor);
    let available = catalog.entries().iter().filter(|m| m.arch == arch && m.image.is_some()).count();
    println!("  Kernels:    {} linked for {}", available, arch);
    Ok(())
}

fn cmd_catalog(manifest: Option<&Path>, arch: Option<SmVersion>, dtype: Option<DataType>) -> anyhow::Result<()> {
    let catalog = load_catalog(manifest)?;
    let mut shown = 0;
    for meta in catalog.entries() {
        if arch.is_some_and(|a| a != meta.arch) || dtype.is_some_and(|d| d != meta.data_type) {
            continue;
        }
        let image = match meta.image {
            Some(image) => format!("image {} ({} B)", image.id.0, image.bytes.len()),
            None => "excluded".to_string(),
        };
        println!("{:<6} {:<5} {}  {:<40} {}", meta.arch, meta.data_type, meta.variant_key(), meta.symbol, image);
        shown += 1;
    }
    println!("{} of {} entries", shown, catalog.len());
    Ok(())
}

fn cmd_select(
    manifest: Option<&Path>,
    request_path: &Path,
    arch: SmVersion,
    sms: u32,
    dtype: DataType,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    if !dtype.is_activation_type() {
        bail!("precompiled kernels are built for fp16 and bf16, not {}", dtype);
    }
    let catalog = load_catalog(manifest)?;
    let config = load_config(config_path)?;
    tracing::debug!("Selecting from {} catalog entries with {:?}", catalog.len(), config);
    let text = std::fs::read_to_string(request_path)
        .with_context(|| format!("reading {}", request_path.display()))?;
    let request: AttentionRequest = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", request_path.display()))?;
    request.validate()?;

    let key = VariantKey::for_request(&request)?;
    let entry = catalog
        .matching(dtype, arch)
        .find(|(_, m)| m.image.is_some() && m.variant_key() == key);
    let gain = may_have_perf_gain(&request, sms, &config);

    println!("Variant key:  {}", key);
    println!("Supported:    {}", entry.is_some());
    println!(
        "Perf gate:    {} ({} blocks x {} vs {} SMs{})",
        gain,
        estimated_block_count(&request, &config),
        config.enable_min_block_factor,
        sms,
        if config.force_precompiled { ", forced" } else { "" }
    );

    let Some((index, meta)) = entry else {
        println!("No kernel for {} {}; the generic path handles this request.", arch, dtype);
        return Ok(());
    };
    println!("Kernel:       {}", meta.symbol);

    // The family tag is read from the image at load; offline it follows the cache type.
    let family = if arch == SmVersion::SM_90
        && request.kv_cache_data_type == DataType::E4m3
        && request.beam_width == 1
    {
        KernelFamily::HopperWarpSpecialized
    } else {
        KernelFamily::WarpSpecialized
    };
    let strategy = if request.multi_query_tokens {
        LaunchStrategy::Speculative
    } else {
        LaunchStrategy::Decode { tensor_map: family == KernelFamily::HopperWarpSpecialized }
    };
    let info = FunctionInfo {
        meta_index: index,
        shared_mem_bytes: 0,
        function: FunctionHandle(0),
        family,
        strategy,
    };
    let multi_block = multi_block_count(&request, sms, &config);
    let geometry = plan_geometry(&info, &request, multi_block)?;
    println!("Family:       {:?}", family);
    println!("Multi-block:  {}", multi_block);
    println!("Grid:         {:?}", geometry.grid);
    println!("Block:        {:?}", geometry.block);
    Ok(())
}
