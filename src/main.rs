use bobby_bit::engine::{self, EngineConfig};
use bobby_bit::storage::AssemblyBuffer;
use bobby_bit::torrent::Metainfo;
use bobby_bit::tracker::http;
use bobby_bit::utils;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(about = "A minimal BitTorrent leecher: fetches a single file from a swarm and exits.")]
struct Cli {
    #[arg(help = "path to the .torrent descriptor")]
    file: PathBuf,
    #[arg(help = "path where the downloaded file is written")]
    out: PathBuf,
    #[arg(short, long, default_value_t = 6881, help = "port advertised to the tracker")]
    port: u16,
    #[arg(short, long, action = clap::ArgAction::Count, help = "increase log verbosity (-v, -vv)")]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    init_logger(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn run(args: &Cli) -> anyhow::Result<()> {
    let metainfo = Metainfo::from_path(&args.file)?;
    log::info!(
        "{}: {} bytes across {} pieces",
        metainfo.name,
        metainfo.length,
        metainfo.num_pieces()
    );

    let local_id = utils::generate_peer_id();
    let response = http::announce(&metainfo, local_id, args.port)?;
    log::info!("tracker returned {} peers", response.peers.len());

    let config = EngineConfig {
        peers: response.peers.into_iter().map(std::net::SocketAddr::V4).collect(),
        local_id,
        info_digest: metainfo.info_digest,
        piece_digests: metainfo.piece_digests.clone(),
        piece_length: metainfo.piece_length,
        total_length: metainfo.length,
        file_name: metainfo.name.clone(),
    };

    let bytes = engine::download(config)?;
    AssemblyBuffer::save_to_file(&bytes, &args.out)?;
    log::info!("wrote {} bytes to {}", bytes.len(), args.out.display());

    Ok(())
}
