//! Demo: ring attention on an in-process ring versus the full-sequence
//! reference, on identical weights and inputs.

use candle_core::{DType, Device, Tensor};
use clap::Parser;

use ring_attention::{LocalWorld, RingAttention, RingAttentionConfig, SingleProcess};

#[derive(Parser, Debug)]
#[command(name = "ring-attention")]
#[command(about = "Compare ring attention against full-sequence attention")]
struct Args {
    /// Number of ranks in the ring
    #[arg(long, default_value = "4")]
    world_size: usize,

    /// Batch size per rank
    #[arg(long, default_value = "2")]
    batch: usize,

    /// Sequence length per batch item
    #[arg(long, default_value = "1024")]
    seq_len: usize,

    /// Model dimension
    #[arg(long, default_value = "128")]
    dim: usize,

    /// Number of attention heads
    #[arg(long, default_value = "4")]
    heads: usize,

    /// Dimension per head
    #[arg(long, default_value = "32")]
    head_dim: usize,

    /// Sequence shard size per rank
    #[arg(long, default_value = "256")]
    ring_seq_size: usize,

    /// Query/key bucket size for the blockwise fold
    #[arg(long, default_value = "64")]
    bucket_size: usize,

    /// Apply causal masking
    #[arg(long)]
    causal: bool,
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    let diff = (a - b)?.abs()?;
    Ok(diff
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .fold(0.0, f32::max))
}

fn main() -> ring_attention::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let device = Device::Cpu;

    println!("ring-attention v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "world_size={} batch={} seq_len={} ring_seq_size={} causal={}",
        args.world_size, args.batch, args.seq_len, args.ring_seq_size, args.causal
    );

    let config = RingAttentionConfig::new(args.dim, args.heads, args.head_dim)
        .with_causal(args.causal)
        .with_bucket_sizes(args.bucket_size, args.bucket_size)
        .with_ring(args.ring_seq_size);

    let module = RingAttention::new_random(&config, args.world_size, DType::F32, &device)?;
    let reference = module.clone().with_world_size(1);

    // Each rank owns its own batch items, full sequences.
    let inputs = (0..args.world_size)
        .map(|_| Tensor::randn(0.0f32, 1.0, (args.batch, args.seq_len, args.dim), &device))
        .collect::<candle_core::Result<Vec<_>>>()?;

    let handles: Vec<_> = LocalWorld::create(args.world_size)
        .into_iter()
        .zip(inputs.iter().cloned())
        .map(|(group, x)| {
            let module = module.clone();
            std::thread::spawn(move || module.forward(&x, None, &group))
        })
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        let ring_out = handle.join().expect("rank thread panicked")?;
        let ref_out = reference.forward(&inputs[rank], None, &SingleProcess)?;
        let diff = max_abs_diff(&ring_out, &ref_out)?;
        println!("rank {rank}: max |ring - reference| = {diff:.3e}");
    }

    Ok(())
}
