/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use log::{error, info};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use anonet::{
    event::Route,
    identity::Identity,
    relay::RelayServer,
    settings::DEFAULT_RELAY_PORT,
    store::{ContactStore, FileContactStore, FileIdentityStore, IdentityStore, StoredIdentity},
    system::ExecutorPtr,
    transfer,
    util::path::{base_dir, expand_path},
    Error, Node, NodePtr, Result,
};

mod config;
use config::ConfigFile;

const CONFIG_FILE: &str = "config.toml";

#[derive(Parser)]
#[clap(name = "anonet", about = "Anonymous peer-to-peer file transfer", version)]
#[clap(arg_required_else_help(true))]
struct Args {
    #[clap(short, action = clap::ArgAction::Count)]
    /// Increase verbosity (-vvv supported)
    verbose: u8,

    #[clap(short, long)]
    /// Data directory (default ~/.anonet)
    base_dir: Option<String>,

    #[clap(long)]
    /// Display name for a newly created identity
    name: Option<String>,

    #[clap(subcommand)]
    command: Subcmd,
}

#[derive(Subcommand)]
enum Subcmd {
    /// Publish our announcement and keep it fresh
    Announce {},

    /// Resolve a username to its current announcement
    Lookup {
        /// Peer username (`name#DISCRIMINATOR`)
        username: String,
    },

    /// Send a file to a peer (direct, falling back to relay)
    Send {
        username: String,
        path: String,
    },

    /// Wait for an inbound transfer
    Recv {
        #[clap(short, long, default_value = ".")]
        /// Directory received files are written into
        out: String,
    },

    /// Run a relay node (TCP relay + onion hop service)
    RelayNode {
        #[clap(long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
    },

    /// Send a file through a 3-hop onion circuit
    Onion {
        username: String,
        path: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    if TermLogger::init(
        log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        eprintln!("Logger already initialized");
    }

    let executor: ExecutorPtr = Arc::new(smol::Executor::new());
    let (signal, shutdown) = smol::channel::unbounded::<()>();

    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let (_, result) = easy_parallel::Parallel::new()
        .each(0..threads, {
            let executor = executor.clone();
            move |_| smol::block_on(executor.run(shutdown.recv()))
        })
        .finish(|| {
            smol::block_on(async {
                let result = realmain(args, executor.clone()).await;
                drop(signal);
                result
            })
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &Error) -> u8 {
    match error {
        Error::Storage(_) => 3,
        Error::Crypto(_) |
        Error::SignatureVerifyFailed |
        Error::RecordReplayed |
        Error::KeyDerivationFailed(_) |
        Error::AuthFailed(_) |
        Error::FingerprintMismatch => 10,
        Error::PeerNotFound(_) | Error::ValueNotFound => 12,
        _ => 11,
    }
}

async fn realmain(args: Args, executor: ExecutorPtr) -> Result<()> {
    let base = match &args.base_dir {
        Some(dir) => expand_path(dir)?,
        None => base_dir()?,
    };

    let config = ConfigFile::load(&base.join(CONFIG_FILE))?;
    let display_name =
        args.name.clone().or(config.name.clone()).unwrap_or_else(|| "anon".to_string());
    let settings = config.into_settings();

    let identity = load_or_create_identity(&base, &display_name)?;
    info!("Identity: {}", identity.username());

    let contacts: Arc<dyn ContactStore> = Arc::new(FileContactStore::new(&base));
    let node = Node::new(settings, identity, Some(contacts)).await?;
    node.start(&executor).await?;

    let result = run_command(args, &node, &executor).await;

    node.stop().await;
    result
}

fn load_or_create_identity(base: &PathBuf, display_name: &str) -> Result<Identity> {
    let store = FileIdentityStore::new(base);

    if let Some(stored) = store.load()? {
        return Identity::from_mnemonic(&stored.name, &stored.mnemonic)
    }

    let (identity, mnemonic) = Identity::generate(display_name)?;
    store.save(&StoredIdentity { name: display_name.to_string(), mnemonic: mnemonic.clone() })?;

    info!("Created new identity {}", identity.username());
    info!("Recovery mnemonic (write this down): {mnemonic}");
    Ok(identity)
}

async fn run_command(args: Args, node: &NodePtr, executor: &ExecutorPtr) -> Result<()> {
    match args.command {
        Subcmd::Announce {} => {
            node.announce().await?;
            node.start_announcing(executor);
            info!("Announcing as {}; ctrl-c to stop", node.identity().username());
            wait_for_signal().await
        }

        Subcmd::Lookup { username } => {
            let announcement = node.resolve(&username).await?;
            println!("username:    {}", announcement.username);
            println!("fingerprint: {}", announcement.fingerprint);
            println!("address:     {}", announcement.address);
            println!(
                "ports:       {}",
                announcement
                    .port_candidates
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            Ok(())
        }

        Subcmd::Send { username, path } => {
            let mut channel = node.connect(&username, Route::Direct).await?;
            transfer::send_file(&mut channel, &expand_path(&path)?, node.events()).await?;
            info!("Transfer complete");
            channel.close().await
        }

        Subcmd::Recv { out } => {
            node.announce().await?;
            node.start_announcing(executor);
            info!("Waiting for a transfer; ctrl-c to abort");

            let mut channel = node.accept().await?;
            info!("Session with {}", channel.peer());
            let path = transfer::recv_file(&mut channel, &expand_path(&out)?, node.events()).await?;
            println!("{}", path.display());
            channel.close().await
        }

        Subcmd::RelayNode { port } => {
            let relay = RelayServer::bind(port).await?;
            relay.start(executor);

            // Serve onion circuits on the transport socket too. The
            // accept loop only returns for session handshakes, which a
            // pure relay just drops.
            let node_ = node.clone();
            let accept_task = executor.spawn(async move {
                loop {
                    if let Ok(channel) = node_.accept().await {
                        let _ = channel.close().await;
                    }
                }
            });

            node.announce().await.ok();
            node.start_announcing(executor);
            info!("Relay node running; ctrl-c to stop");
            let result = wait_for_signal().await;

            accept_task.cancel().await;
            relay.stop().await;
            result
        }

        Subcmd::Onion { username, path } => {
            let mut channel = node.connect(&username, Route::Onion).await?;
            transfer::send_file(&mut channel, &expand_path(&path)?, node.events()).await?;
            info!("Transfer complete (onion)");
            channel.close().await
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    let (signal, shutdown) = smol::channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal.try_send(());
    })
    .map_err(|e| Error::Storage(format!("signal handler: {e}")))?;

    shutdown.recv().await?;
    print!("\r");
    info!("Caught termination signal, cleaning up and exiting...");
    Ok(())
}
