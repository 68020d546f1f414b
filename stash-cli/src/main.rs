//! Stash command line client
//!
//! Thin command surface over `stash-core`: local history commands work on
//! the repository containing the working directory, sync commands talk to
//! a stash server.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use stash_core::client;
use stash_core::config::{ClientOptions, Credentials, Fingerprint, Remote, RemoteConfig};
use stash_core::diff;
use stash_core::repository::CONTROL_DIR;
use stash_core::{CipherSuite, ConsolePrinter, MergeOutcome, ObjectId, Printer, Repository};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stash")]
#[command(author = "Stash Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Distributed version control with encrypted sync")]
struct Cli {
    /// Run as if started in this directory
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Credentials and transport settings for commands that reach a server
#[derive(clap::Args, Debug, Clone)]
struct SyncArgs {
    /// User to log in as
    #[arg(long, global = true, env = "STASH_USER")]
    user: Option<String>,

    #[arg(long, global = true, env = "STASH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Packet cipher; must match the server
    #[arg(long, global = true, default_value = "legacy")]
    cipher: CipherSuite,

    /// Socket read timeout in seconds, 0 disables it
    #[arg(long, global = true, default_value_t = 120)]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty repository
    Init { path: Option<PathBuf> },

    /// Stage files or directories
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Record the staged snapshot on the current branch
    Commit {
        #[arg(short, long)]
        message: String,
    },

    /// Show the history of a branch
    Log { branch: Option<String> },

    /// List, create or delete branches
    Branch {
        name: Option<String>,

        #[arg(short, long)]
        delete: bool,
    },

    /// Switch branches
    Checkout {
        branch: String,

        /// Create the branch from the current tip first
        #[arg(short = 'b')]
        create: bool,
    },

    /// Merge a branch into the current one
    Merge { branch: String },

    /// Show changes between two commits
    Diff { from: ObjectId, to: ObjectId },

    /// Print an object's payload
    CatFile { id: ObjectId },

    /// List a tree's entries
    LsTree { id: ObjectId },

    /// Manage remotes
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },

    /// Send the current branch to a remote
    Push {
        #[arg(default_value = client::ORIGIN)]
        remote: String,
    },

    /// Fetch a remote branch and merge it into the current branch
    Pull {
        #[arg(default_value = client::ORIGIN)]
        remote: String,
    },

    /// Copy a remote branch into a new repository
    Clone {
        /// Repository fingerprint: owner@repository.stash
        fingerprint: Fingerprint,

        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Server address (host:port)
        #[arg(short, long)]
        address: Option<String>,

        /// Target directory, defaults to <repository>-<branch>
        target: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Register a remote
    Add {
        name: String,
        fingerprint: Fingerprint,

        /// Server address (host:port)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// List remotes
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let printer = ConsolePrinter;
    if let Err(e) = run(cli, &printer).await {
        printer.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, printer: &dyn Printer) -> Result<()> {
    let dir = std::path::absolute(&cli.dir)?;

    match cli.command {
        Commands::Init { path } => {
            let target = path.map(|p| dir.join(p)).unwrap_or_else(|| dir.clone());
            let repo = Repository::init(&target)?;
            printer.println(&format!("Initialized empty repository in {:?}", repo.meta_dir()));
        }

        Commands::Add { paths } => {
            let repo = open_repository(&dir)?;
            let mut staged = 0;
            for path in paths {
                staged += repo
                    .add(&dir.join(&path))
                    .with_context(|| format!("failed to add {:?}", path))?;
            }
            printer.println(&format!("{} file(s) staged", staged));
        }

        Commands::Commit { message } => {
            let repo = open_repository(&dir)?;
            let id = repo.commit(&message)?;
            printer.highlight(&format!("[{}] {}", repo.current_branch()?, id));
        }

        Commands::Log { branch } => {
            let repo = open_repository(&dir)?;
            let branch = match branch {
                Some(branch) => branch,
                None => repo.current_branch()?,
            };
            for (id, commit) in repo.log(&branch)? {
                printer.highlight(&format!("commit {}", id));
                printer.println(&format!("    {}\n", commit.message));
            }
        }

        Commands::Branch { name: None, .. } => {
            let repo = open_repository(&dir)?;
            let current = repo.current_branch()?;
            for branch in repo.branches()? {
                if branch == current {
                    printer.highlight(&format!("* {}", branch));
                } else {
                    printer.println(&format!("  {}", branch));
                }
            }
        }

        Commands::Branch { name: Some(name), delete } => {
            let repo = open_repository(&dir)?;
            if delete {
                repo.delete_branch(&name)?;
                printer.println(&format!("Deleted branch {}", name));
            } else {
                let tip = repo.head_commit(&repo.current_branch()?)?;
                repo.create_branch(&name, tip)?;
                printer.println(&format!("Created branch {}", name));
            }
        }

        Commands::Checkout { branch, create } => {
            let repo = open_repository(&dir)?;
            repo.checkout(&branch, create)?;
            printer.println(&format!("Switched to branch '{}'", branch));
        }

        Commands::Merge { branch } => {
            let repo = open_repository(&dir)?;
            report_merge(printer, &branch, repo.merge(&branch)?);
        }

        Commands::Diff { from, to } => {
            let repo = open_repository(&dir)?;
            let lines = repo.diff_commits(&from, &to)?;
            if lines.is_empty() {
                printer.println("No differences");
            }
            for line in diff::render(&lines).lines() {
                printer.println(line);
            }
        }

        Commands::CatFile { id } => {
            let repo = open_repository(&dir)?;
            let payload = repo.cat_file(&id)?;
            printer.println(&String::from_utf8_lossy(&payload));
        }

        Commands::LsTree { id } => {
            let repo = open_repository(&dir)?;
            for entry in repo.ls_tree(&id)?.iter() {
                printer.println(&format!("{} {} {}", entry.kind, entry.id, entry.path));
            }
        }

        Commands::Remote { action } => {
            let repo = open_repository(&dir)?;
            let mut remotes = RemoteConfig::load(&repo.config_path())?;
            match action {
                RemoteAction::Add {
                    name,
                    fingerprint,
                    address,
                } => {
                    let mut remote = Remote::new(&name, fingerprint);
                    if let Some(address) = address {
                        remote = remote.with_address(address);
                    }
                    remotes.add(remote)?;
                    remotes.save(&repo.config_path())?;
                    printer.println(&format!("Added remote {}", name));
                }
                RemoteAction::List => {
                    for remote in remotes.remotes() {
                        printer.println(&format!("{}\t{}\t{}", remote.name, remote.fingerprint, remote.address));
                    }
                }
            }
        }

        Commands::Push { remote } => {
            let repo = open_repository(&dir)?;
            let remote = find_remote(&repo, &remote)?;
            let report = client::push(&repo, &remote, &client_options(&cli.sync)?).await?;
            printer.println(&format!("Sent {} object(s) to {}", report.objects, remote.fingerprint));
            printer.highlight(&format!(
                "{}: {} -> {}",
                report.branch,
                stash_core::object::optional_hex(report.previous),
                report.tip
            ));
        }

        Commands::Pull { remote } => {
            let repo = open_repository(&dir)?;
            let remote = find_remote(&repo, &remote)?;
            let outcome = client::pull(&repo, &remote, &client_options(&cli.sync)?).await?;
            report_merge(printer, &remote.name, outcome);
        }

        Commands::Clone {
            fingerprint,
            branch,
            address,
            target,
        } => {
            let target = match target {
                Some(target) => dir.join(target),
                None => client::default_clone_dir(&dir, &fingerprint.repository, &branch),
            };
            let mut remote = Remote::new(client::ORIGIN, fingerprint);
            if let Some(address) = address {
                remote = remote.with_address(address);
            }
            let repo = client::clone(&remote, &branch, &target, &client_options(&cli.sync)?).await?;
            printer.println(&format!("Cloned {} into {:?}", remote.fingerprint, repo.work_dir()));
        }
    }

    Ok(())
}

/// Closest enclosing directory that holds a repository
fn open_repository(start: &Path) -> Result<Repository> {
    let root = start
        .ancestors()
        .find(|dir| dir.join(CONTROL_DIR).join("HEAD").is_file())
        .with_context(|| format!("not a stash repository (or any parent): {:?}", start))?;
    Ok(Repository::open(root)?)
}

fn find_remote(repo: &Repository, name: &str) -> Result<Remote> {
    let remotes = RemoteConfig::load(&repo.config_path())?;
    remotes
        .get(name)
        .cloned()
        .with_context(|| format!("no remote named '{}'", name))
}

fn client_options(args: &SyncArgs) -> Result<ClientOptions> {
    let (Some(user), Some(password)) = (&args.user, &args.password) else {
        bail!("credentials required: pass --user and set STASH_PASSWORD");
    };
    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    Ok(ClientOptions::new(Credentials::new(user, password))
        .with_cipher(args.cipher)
        .with_read_timeout(timeout))
}

fn report_merge(printer: &dyn Printer, branch: &str, outcome: MergeOutcome) {
    match outcome {
        MergeOutcome::UpToDate => printer.println("Already up to date"),
        MergeOutcome::FastForward { tip } => printer.highlight(&format!("Fast-forward to {}", tip)),
        MergeOutcome::ThreeWay { commit, ancestor } => {
            printer.println(&format!("Merged {} (common ancestor {})", branch, ancestor));
            printer.highlight(&format!("Merge commit {}", commit));
        }
    }
}
