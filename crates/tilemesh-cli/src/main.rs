use std::path::PathBuf;

use anyhow::{bail, ensure, Context};
use clap::Parser;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use tilemesh_conv::*;
use tilemesh_core::device::{BufferType, DeviceMesh, MeshConfig, WorkerMode};
use tilemesh_core::distributed::{aggregate, distribute, num_buffers};
use tilemesh_core::sharding::{compute_shard_division, Size};
use tilemesh_core::{DType, DistributedTensorConfig, Layout, MemoryConfig, Shape, Tensor};

#[derive(Parser)]
#[command(
    name = "tilemesh",
    about = "Tensor storage and tile layouts across a device mesh",
    version
)]
struct Cli {
    /// JSON mesh config: {"rows", "cols", "device": {"dram_size", "l1_size", "worker_mode"}}
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Mesh rows (overrides the config file)
    #[arg(long, global = true)]
    rows: Option<usize>,
    /// Mesh columns (overrides the config file)
    #[arg(long, global = true)]
    cols: Option<usize>,
    /// Run device workers in synchronous mode
    #[arg(long, global = true)]
    sync: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the mesh config and open every device
    Info,
    /// Split a 2-D view into shards
    Plan {
        #[arg(long)]
        height: usize,
        #[arg(long)]
        width: usize,
        #[arg(long)]
        shard_height: usize,
        #[arg(long)]
        shard_width: usize,
    },
    /// Convert random convolution weights and check the conversion inverts
    Convert {
        /// Weight shape K,C,R,S (bias: 1,1,1,K)
        #[arg(long, value_delimiter = ',', required = true)]
        shape: Vec<usize>,
        #[arg(long, value_enum, default_value_t = Policy::Tiled)]
        policy: Policy,
        #[arg(long, default_value = "1")]
        block_h: usize,
        #[arg(long, default_value = "1")]
        block_w: usize,
        /// Channel shards for block-sharded weights and biases
        #[arg(long, default_value = "1")]
        shards: usize,
        #[arg(long, default_value = "1")]
        groups: usize,
        #[arg(long, default_value = "1")]
        act_block_h_ntiles: usize,
        /// Output dtype: bfloat16, float32, uint32, bfloat8_b, bfloat4_b, ...
        #[arg(long)]
        dtype: Option<DType>,
    },
    /// Shard a random tensor across the mesh, read it back and compare
    Scatter {
        /// Tensor shape, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        shape: Vec<usize>,
        /// Dimension to shard along
        #[arg(long, default_value = "0")]
        dim: usize,
        /// Place shards in L1 instead of DRAM
        #[arg(long)]
        l1: bool,
        /// Queue the reads and wait on the result
        #[arg(long)]
        non_blocking: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Policy {
    Tiled,
    Special,
    BlockSharded,
    Bias,
    Grouped,
    Depthwise,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Info => cmd_info(config),
        Commands::Plan { height, width, shard_height, shard_width } => {
            cmd_plan(Size::new(height, width), Size::new(shard_height, shard_width))
        }
        Commands::Convert { shape, policy, block_h, block_w, shards, groups, act_block_h_ntiles, dtype } => {
            let params = ConvertParams { block_h, block_w, shards, groups, act_block_h_ntiles, dtype };
            cmd_convert(&shape, policy, &params)
        }
        Commands::Scatter { shape, dim, l1, non_blocking } => cmd_scatter(config, &shape, dim, l1, non_blocking),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MeshConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<MeshConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => MeshConfig::default(),
    };
    if let Some(rows) = cli.rows {
        config.rows = rows;
    }
    if let Some(cols) = cli.cols {
        config.cols = cols;
    }
    if cli.sync {
        config.device.worker_mode = WorkerMode::Synchronous;
    }
    tracing::debug!("mesh config: {:?}", config);
    Ok(config)
}

fn cmd_info(config: MeshConfig) -> anyhow::Result<()> {
    println!("tilemesh v{}\n", env!("CARGO_PKG_VERSION"));
    println!("Config");
    println!("{}\n", serde_json::to_string_pretty(&config)?);

    let mesh = DeviceMesh::open(config)?;
    let (rows, cols) = mesh.shape();
    println!("Mesh {}x{} ({} devices)", rows, cols, mesh.num_devices());
    println!("  {:<8} {:>6} {:>14} {:>14} {:>14}", "Device", "Pos", "DRAM free", "L1 free", "Mode");
    for row in 0..rows {
        for col in 0..cols {
            let Some(device) = mesh.device(row, col) else { continue };
            println!(
                "  {:<8} {:>6} {:>14} {:>14} {:>14}",
                device.id().to_string(),
                format!("{},{}", row, col),
                device.free_bytes(BufferType::Dram),
                device.free_bytes(BufferType::L1),
                format!("{:?}", device.worker_mode()),
            );
        }
    }
    mesh.close();
    Ok(())
}

fn cmd_plan(shape: Size, shard: Size) -> anyhow::Result<()> {
    let spec = compute_shard_division(shape, shard)?;
    println!("{} in {} shards", shape, shard);
    println!("  height: {} shards, last {}", spec.num_shards_height, spec.last_shard_height);
    println!("  width:  {} shards, last {}", spec.num_shards_width, spec.last_shard_width);
    println!("  total:  {}", spec.num_shards());
    Ok(())
}

struct ConvertParams {
    block_h: usize,
    block_w: usize,
    shards: usize,
    groups: usize,
    act_block_h_ntiles: usize,
    dtype: Option<DType>,
}

fn random_tensor(shape: &[usize]) -> anyhow::Result<(Vec<f32>, Tensor)> {
    let mut rng = rand::thread_rng();
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let tensor = Tensor::from_vec(values.clone(), shape.to_vec(), Layout::RowMajor)?;
    Ok((values, tensor))
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn cmd_convert(shape: &[usize], policy: Policy, params: &ConvertParams) -> anyhow::Result<()> {
    let &[k, c, r, s] = shape else {
        bail!("--shape needs four entries, got {:?}", shape);
    };
    let dims = [k, c, r, s];
    let (values, weight) = random_tensor(shape)?;
    let dtype = params.dtype;

    let (converted, restored, expected) = match policy {
        Policy::Tiled => {
            let out = convert_conv_weight_tensor_to_tiled_layout(&weight, params.block_h, params.block_w, dtype)?;
            let back = restore_tiled(&out, &TiledWeight::new(dims, params.block_h, params.block_w)?)?;
            (out, back, values)
        }
        Policy::Special => {
            let map = SpecialPaddingWeight::new(dims, params.block_h, params.block_w)?;
            let out = convert_conv_weight_tensor_to_special_padding_tiled_layout(
                &weight,
                params.block_h,
                params.block_w,
                dtype,
            )?;
            let back = restore_tiled(&out, &map)?;
            (out, back, values)
        }
        Policy::BlockSharded => {
            let out = convert_conv_weight_tensor_to_tiled_layout_block_sharded(&weight, params.shards, dtype)?;
            let back = restore_tiled(&out, &BlockShardedWeight::new(dims, params.shards)?)?;
            (out, back, values)
        }
        Policy::Bias => {
            let out = convert_conv_bias_tensor_to_tiled_layout_block_sharded(&weight, params.shards, dtype)?;
            let back = restore_tiled(&out, &BlockShardedBias::new(weight.shape(), params.shards)?)?;
            (out, back, values)
        }
        Policy::Grouped => {
            let out = convert_conv_weight_tensor_to_grouped_layout(&weight, params.groups, dtype)?;
            let back = restore_grouped(&out, &GroupedWeight::new(dims, params.groups)?)?;
            (out, back, values)
        }
        Policy::Depthwise => {
            let map = DepthwiseWeight::new(dims, params.act_block_h_ntiles)?;
            let out = convert_conv_weight_tensor_to_depthwise_layout(&weight, params.act_block_h_ntiles, dtype)?;
            let back = restore_depthwise(&out, &map)?;
            let plane = r * s;
            let channel_zero = (0..k).flat_map(|i| values[i * c * plane..][..plane].to_vec()).collect();
            (out, back, channel_zero)
        }
    };

    println!("input:  {} {} {}", weight.shape(), weight.dtype(), weight.layout());
    println!("output: {} {} {}", converted.shape(), converted.dtype(), converted.layout());
    let restored = restored.to_vec::<f32>()?;
    let err = max_abs_diff(&expected, &restored);
    if converted.dtype().is_block_float() {
        println!("restore: max abs error {err:.6} (lossy {})", converted.dtype());
    } else {
        ensure!(err == 0.0, "restored weights differ by up to {err}");
        println!("restore: exact");
    }
    Ok(())
}

fn cmd_scatter(config: MeshConfig, shape: &[usize], dim: usize, l1: bool, non_blocking: bool) -> anyhow::Result<()> {
    ensure!(dim < shape.len(), "--dim {dim} is out of range for shape {shape:?}");
    let mesh = DeviceMesh::open(config)?;
    let n = mesh.num_devices();
    let (values, host) = random_tensor(shape)?;

    let sharded = distribute(&host, DistributedTensorConfig::Shard { dim }, n)?;
    let memory_config = if l1 { MemoryConfig::l1() } else { MemoryConfig::dram() };
    let on_mesh = sharded.to_mesh(&mesh, memory_config)?;
    println!(
        "placed {} as {} shards of {} in {}",
        Shape::from(shape.to_vec()),
        num_buffers(&on_mesh),
        on_mesh.shape(),
        memory_config.buffer_type
    );

    let gathered = on_mesh.cpu(!non_blocking, 0)?;
    let joined = aggregate(&gathered)?;
    ensure!(joined.shape().dims() == shape, "gathered shape {} differs", joined.shape());
    let back = joined.to_vec::<f32>()?;
    ensure!(back == values, "gathered data differs from the source");
    println!("gathered {} back from {} devices: match", joined.shape(), n);
    mesh.close();
    Ok(())
}
