// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

/// Command-line interface for the braid entanglement engine.
///
/// Supports entangling a file into parity strands, uploading files to a
/// gateway node, and downloading files with lattice-based repair. Uses
/// `clap` for argument parsing and `stderrlog` for logging.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use log::info;
use sha2::{Digest, Sha256};

use braid_chunker::{build_complete_tree, split, BuildTreeOptions, NoopRepairer, TreeChunk};
use braid_entangler::{
    Config, DownloadStatus, EntangledBlock, Entangler, Lattice, ParityCollector, RepairStatus,
    StrandClass,
};
use braid_storage::http::{HttpGetter, HttpPutter};
use braid_storage::mem::MemChunkStore;
use braid_storage::{parse_address, Address, Getter, CHUNK_SIZE};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway node endpoint.
    #[arg(long, env = "BRAID_ENDPOINT", default_value = "http://localhost:8500")]
    endpoint: String,

    /// Logging verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Entangle a file (by path or gateway address) into parity strands
    Entangle(EntangleArgs),
    /// Download a file, repairing it through its parity strands if needed
    Download(DownloadArgs),
    /// Upload a file to the gateway node
    Upload(UploadArgs),
}

#[derive(Args)]
struct EntangleArgs {
    /// Hex root address on the gateway, or a local file path.
    target: String,

    /// Parities per data block.
    #[arg(short, long, default_value_t = 3)]
    alpha: usize,

    /// Horizontal strands.
    #[arg(short, long, default_value_t = 5)]
    s: usize,

    /// Helical strands.
    #[arg(short, long, default_value_t = 5)]
    p: usize,

    /// Close the lattice into a torus.
    #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set)]
    close: bool,

    /// Upload the parity strands to the gateway.
    #[arg(short = 'u', long, default_value_t = true, action = clap::ArgAction::Set)]
    doupload: bool,

    /// Only list the chunk addresses in entanglement order.
    #[arg(short, long)]
    listchunks: bool,
}

#[derive(Args)]
struct DownloadArgs {
    /// `<size_hex>,<data root>,<parity root>...` — or a single data root for
    /// a plain download.
    spec: String,

    /// Re-upload repaired chunks to the gateway.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    dorepair: bool,

    /// Print per-block CSV telemetry and a summary.
    #[arg(short, long)]
    benchmark: bool,

    #[arg(short, long, default_value = "download")]
    output: PathBuf,

    #[arg(short, long, default_value_t = 3)]
    alpha: usize,

    #[arg(short, long, default_value_t = 5)]
    s: usize,

    #[arg(short, long, default_value_t = 5)]
    p: usize,
}

#[derive(Args)]
struct UploadArgs {
    file: PathBuf,

    /// Download the file again and compare hashes.
    #[arg(long)]
    verifyupload: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .verbosity(cli.verbose as usize + 1)
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()?;

    match cli.command {
        Commands::Entangle(args) => entangle(&cli.endpoint, args).await,
        Commands::Download(args) => download(&cli.endpoint, args).await,
        Commands::Upload(args) => upload(&cli.endpoint, args).await,
    }
}

async fn entangle(endpoint: &str, args: EntangleArgs) -> anyhow::Result<()> {
    let config = Config::new(args.alpha, args.s, args.p)?;

    // A target that parses as an address is fetched from the gateway;
    // anything else is treated as a local file.
    let streams = match parse_address(&args.target) {
        Ok(root) => {
            let getter = HttpGetter::new(endpoint);
            entangle_tree(&root, &getter, config, args.close, args.listchunks).await?
        }
        Err(_) => {
            let data = tokio::fs::read(&args.target)
                .await
                .with_context(|| format!("could not read {}", args.target))?;
            let store = MemChunkStore::new();
            let root = split(&data, &store)?;
            entangle_tree(&root, &store, config, args.close, args.listchunks).await?
        }
    };

    if args.listchunks {
        return Ok(());
    }

    if args.doupload {
        let putter = HttpPutter::new(endpoint);
        for (class, stream) in StrandClass::list(config.alpha).into_iter().zip(streams) {
            let root = putter.upload_file(stream).await?;
            println!("uploaded {class} parity strand: {}", hex::encode(root));
        }
    } else {
        let dir = std::env::temp_dir().join("braid-parities");
        tokio::fs::create_dir_all(&dir).await?;
        for (k, stream) in streams.iter().enumerate() {
            tokio::fs::write(dir.join(k.to_string()), stream).await?;
        }
        println!("entangled files located at: {}", dir.display());
    }

    Ok(())
}

async fn entangle_tree<G: Getter>(
    root: &Address,
    getter: &G,
    config: Config,
    close: bool,
    listchunks: bool,
) -> anyhow::Result<Vec<Bytes>> {
    let tree = build_complete_tree(
        root,
        BuildTreeOptions::default(),
        &NoopRepairer::new(getter),
    )
    .await?;

    let flat = tree.flatten_tree_window(config.s, config.p);
    if listchunks {
        for node in &flat {
            println!("{}", hex::encode(node.key));
        }
        return Ok(Vec::new());
    }

    let mut tangler = Entangler::new(config, CHUNK_SIZE);
    let mut collector = ParityCollector::new(config.alpha);
    let mut emit = |b: EntangledBlock| collector.push(b);
    for (i, node) in flat.iter().enumerate() {
        tangler.entangle(&node.payload(), i as i64 + 1, &mut emit);
    }
    if close {
        tangler.wrap_lattice(&mut emit);
    }

    Ok(collector.into_streams())
}

async fn download(endpoint: &str, args: DownloadArgs) -> anyhow::Result<()> {
    let config = Config::new(args.alpha, args.s, args.p)?;
    let getter = HttpGetter::new(endpoint);

    let parts: Vec<&str> = args.spec.split(',').collect();
    if parts.len() == 1 {
        // Plain download, no repair capability.
        let root = parse_address(parts[0])?;
        let tree = build_complete_tree(
            &root,
            BuildTreeOptions::default(),
            &NoopRepairer::new(getter),
        )
        .await?;
        write_leaves(&tree, tree.subtree_size, &args.output).await?;
        println!("output file without any failure: {}", args.output.display());
        return Ok(());
    }

    if parts.len() < 2 + config.alpha {
        bail!(
            "expected <size_hex>,<data root> and {} parity roots",
            config.alpha
        );
    }

    let size = u64::from_str_radix(parts[0].trim_start_matches("0x"), 16)
        .map_err(|e| anyhow!("invalid size {}: {e}", parts[0]))?;
    let data_root = parse_address(parts[1])?;
    let parity_roots = parts[2..]
        .iter()
        .map(|p| parse_address(p))
        .collect::<Result<Vec<_>, _>>()?;

    let lattice = Lattice::new(config, size, Arc::new(getter), data_root, parity_roots).await?;

    match build_complete_tree(&data_root, BuildTreeOptions::default(), &lattice).await {
        Ok(tree) => {
            write_leaves(&tree, size, &args.output).await?;
            if args.benchmark {
                print_benchmark(&lattice, true);
            }
            if args.dorepair {
                reupload_repaired(endpoint, &lattice).await?;
            }
            println!("output file with repairs: {}", args.output.display());
            Ok(())
        }
        Err(e) => {
            if args.benchmark {
                print_benchmark(&lattice, false);
            }
            Err(e.into())
        }
    }
}

async fn write_leaves(tree: &TreeChunk, size: u64, output: &PathBuf) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(output).await?;
    let mut written = 0u64;
    for leaf in tree.filter_chunks(|c| c.children.is_empty()) {
        let payload = leaf.payload();
        let take = payload.len().min((size - written) as usize);
        file.write_all(&payload[..take]).await?;
        written += take as u64;
    }
    file.flush().await?;
    Ok(())
}

fn print_benchmark(lattice: &Lattice, complete: bool) {
    let mut datablocks = 0;
    let mut parityblocks = 0;
    for (id, block) in lattice.blocks().iter().enumerate() {
        let snap = block.snapshot();
        if !snap.has_data {
            continue;
        }
        if snap.download_status == DownloadStatus::Success {
            if block.is_parity {
                parityblocks += 1;
            } else {
                datablocks += 1;
            }
        }
        println!(
            "{},{},{},{},{},{},{},{}",
            block.is_parity,
            block.position,
            lattice.left_pos(id, 0),
            lattice.right_pos(id, 0),
            snap.has_data,
            snap.download_time.start,
            snap.download_time.end,
            snap.download_status == DownloadStatus::Success,
        );
    }
    let num_data = lattice.num_data_blocks;
    let num_parity = lattice.blocks().len() as i64 - num_data;
    println!(
        "Download {}. Datablocks: {datablocks}/{num_data}, Parityblocks: {parityblocks}/{num_parity}",
        if complete { "complete" } else { "FAILED" },
    );
}

async fn reupload_repaired(endpoint: &str, lattice: &Lattice) -> anyhow::Result<()> {
    let putter = HttpPutter::new(endpoint);
    let mut uploaded = 0;
    for block in lattice.blocks() {
        if block.snapshot().repair_status != RepairStatus::Success {
            continue;
        }
        if let Some(data) = block.data() {
            putter.upload_chunk(data).await?;
            uploaded += 1;
        }
    }
    info!("re-uploaded {uploaded} repaired chunks");
    Ok(())
}

async fn upload(endpoint: &str, args: UploadArgs) -> anyhow::Result<()> {
    let data = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("could not read {}", args.file.display()))?;
    let digest = Sha256::digest(&data);

    let putter = HttpPutter::new(endpoint);
    let root = putter.upload_file(Bytes::from(data)).await?;
    println!("uploaded file. Root: {}", hex::encode(root));

    if args.verifyupload {
        let getter = HttpGetter::new(endpoint);
        let tree = build_complete_tree(
            &root,
            BuildTreeOptions::default(),
            &NoopRepairer::new(getter),
        )
        .await?;

        let mut hasher = Sha256::new();
        let mut total = 0u64;
        for leaf in tree.filter_chunks(|c| c.children.is_empty()) {
            let payload = leaf.payload();
            let take = payload.len().min((tree.subtree_size - total) as usize);
            hasher.update(&payload[..take]);
            total += take as u64;
        }
        if hasher.finalize() == digest {
            println!("hashes equal");
        } else {
            bail!("uploaded file does not match the original");
        }
    }

    Ok(())
}
