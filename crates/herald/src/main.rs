use clap::{Parser, Subcommand};

mod commands;
mod config;
mod output;
mod spool;

use commands::App;
use output::Output;

#[derive(Parser)]
#[command(name = "herald")]
#[command(version)]
#[command(about = "Headless client for end-to-end-encrypted messaging")]
#[command(
    long_about = "Registers accounts, links devices, and sends/receives end-to-end-encrypted\nmessages and group updates over a local spool, for scripts and daemons."
)]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/herald)
    #[arg(long, global = true, env = "HERALD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Account to operate on (default: configured default account)
    #[arg(short, long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start registering an account id
    Register {
        /// Phone-number-like or UUID identity
        id: String,
    },

    /// Submit a verification code and activate the account
    Verify {
        /// Flow id from `register`
        flow_id: String,
        /// Verification code
        code: String,
    },

    /// Start linking this machine as a new device of an account
    Link {
        /// Account id to link into
        id: String,
    },

    /// Confirm a pending link with its provisioning token
    ConfirmLink {
        /// Flow id from `link`
        flow_id: String,
        /// Provisioning token
        token: String,
    },

    /// Abort a pending registration or link flow
    Abort {
        /// Flow id
        flow_id: String,
    },

    /// Remove an account (or linked device) and all its state
    Unlink {
        /// Account handle (`id`, or `id#device`)
        handle: String,
    },

    /// List local accounts
    Accounts,

    /// List this account's linked devices
    Devices,

    /// Send a direct message
    Send {
        /// Recipient account id
        peer: String,
        /// Message text
        message: String,
    },

    /// Send a delivery/read receipt
    Receipt {
        /// Recipient account id
        peer: String,
        /// Receipt type: "delivered" or "read"
        kind: String,
        /// Message ids to acknowledge
        message_ids: Vec<String>,
    },

    /// Send a typing indicator
    Typing {
        /// Recipient account id
        peer: String,
    },

    /// Process envelopes waiting in the inbox spool
    Receive {
        /// Maximum number of envelopes to process
        #[arg(long)]
        max_messages: Option<usize>,
    },

    /// Group management
    #[command(subcommand)]
    Group(GroupCommands),

    /// Peer directory management
    #[command(subcommand)]
    Contact(ContactCommands),

    /// Pre-key inventory management
    #[command(subcommand)]
    Prekeys(PrekeyCommands),
}

#[derive(Subcommand)]
enum GroupCommands {
    /// List known groups
    List,

    /// Show one group's state
    Show {
        /// Group id
        id: String,
    },

    /// Apply and distribute a delta batch at a revision
    Update {
        /// Group id
        id: String,
        /// Revision the batch produces
        revision: u64,
        /// JSON array of delta operations
        deltas: String,
    },

    /// Send a message to a group
    Send {
        /// Group id
        id: String,
        /// Message text
        message: String,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Import a peer device's published pre-key bundle
    AddBundle {
        /// Peer account id
        peer: String,
        /// Peer device id
        device: u32,
        /// Bundle JSON (from the peer's `prekeys publish`)
        bundle: String,
    },

    /// List known peers and their devices
    List,
}

#[derive(Subcommand)]
enum PrekeyCommands {
    /// Show pre-key inventory
    Status,

    /// Top the one-time pool back up
    Replenish {
        /// Generate keys when fewer than this many remain
        #[arg(long, default_value = "20")]
        min: u32,
        /// How many keys to generate
        #[arg(long, default_value = "20")]
        batch: u32,
    },

    /// Consume one one-time pre-key and emit the bundle for peers
    Publish,

    /// Rotate the signed pre-key
    Rotate,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HERALD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output::new(cli.json);

    if let Err(e) = run(cli, &output) {
        output.error(&e.to_string());
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .expect("Could not find data directory")
            .join("herald")
    });

    let mut app = App::open(&data_dir)?;
    let account = cli.account.as_deref();

    match cli.command {
        Commands::Register { id } => commands::account::register(&mut app, &id, output),
        Commands::Verify { flow_id, code } => {
            commands::account::verify(&mut app, &flow_id, &code, output)
        }
        Commands::Link { id } => commands::account::link(&app, &id, output),
        Commands::ConfirmLink { flow_id, token } => {
            commands::account::confirm_link(&app, &flow_id, &token, output)
        }
        Commands::Abort { flow_id } => commands::account::abort(&app, &flow_id, output),
        Commands::Unlink { handle } => commands::account::unlink(&app, &handle, output),
        Commands::Accounts => commands::account::list(&app, output),
        Commands::Devices => commands::account::devices(&app, account, output),
        Commands::Send { peer, message } => {
            commands::message::send(&app, account, &peer, &message, output)
        }
        Commands::Receipt {
            peer,
            kind,
            message_ids,
        } => commands::message::receipt(&app, account, &peer, &kind, message_ids, output),
        Commands::Typing { peer } => commands::message::typing(&app, account, &peer, output),
        Commands::Receive { max_messages } => {
            commands::message::receive(&app, account, max_messages, output)
        }
        Commands::Group(cmd) => match cmd {
            GroupCommands::List => commands::group::list(&app, account, output),
            GroupCommands::Show { id } => commands::group::show(&app, account, &id, output),
            GroupCommands::Update {
                id,
                revision,
                deltas,
            } => commands::group::update(&app, account, &id, revision, &deltas, output),
            GroupCommands::Send { id, message } => {
                commands::group::send(&app, account, &id, &message, output)
            }
        },
        Commands::Contact(cmd) => match cmd {
            ContactCommands::AddBundle {
                peer,
                device,
                bundle,
            } => commands::contact::add_bundle(&app, &peer, device, &bundle, output),
            ContactCommands::List => commands::contact::list(&app, output),
        },
        Commands::Prekeys(cmd) => match cmd {
            PrekeyCommands::Status => commands::account::prekey_status(&app, account, output),
            PrekeyCommands::Replenish { min, batch } => {
                commands::account::prekey_replenish(&app, account, min, batch, output)
            }
            PrekeyCommands::Publish => commands::account::prekey_publish(&app, account, output),
            PrekeyCommands::Rotate => {
                commands::account::rotate_signed_prekey(&app, account, output)
            }
        },
    }
}
