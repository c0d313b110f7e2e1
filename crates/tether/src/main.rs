//! Unified CLI for tether terminal sessions.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};

use eyre::WrapErr as _;
use tracing::info;

use tether_session::Session;

#[derive(clap::Parser)]
#[command(
    name = "tether",
    about = "Persistent terminal sessions on this machine"
)]
struct Args {
    /// Escape character for the attached keyboard (e.g. "^P").
    #[arg(long, short = 'e', global = true)]
    escape: Option<String>,

    /// Internal: run (or respawn) the server for this session.
    #[arg(long, hide = true, value_name = "SESSION")]
    internal: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Create a session and attach to it.
    New {
        /// Session name.
        name: String,
        /// Start detached: spawn the server and return.
        #[arg(short, long)]
        detach: bool,
    },
    /// Attach to a running session.
    Attach {
        /// Session name.
        session: String,
        /// Create the session first if it does not exist.
        #[arg(short, long)]
        create: bool,
    },
    /// List live sessions.
    List,
    /// Terminate a session's server and remove its state.
    Kill {
        /// Session name.
        session: String,
    },
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = <Args as clap::Parser>::parse();
    if std::env::var("_PTY_SHELL").is_ok() {
        eyre::bail!("cannot run tether within a shell spawned by tether");
    }
    let root = tether_session::default_root();
    ensure_root(&root)?;
    let config = tether_config::load().wrap_err("loading configuration")?;

    // Server child entry point, reached only via our own respawn.
    if let Some(name) = args.internal {
        return run_internal(&root, &name, config);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match args.command {
        Some(Command::New { name, detach }) => {
            runtime.block_on(run_new(&root, &name, detach, config, args.escape))
        }
        Some(Command::Attach { session, create }) => {
            runtime.block_on(run_attach(&root, &session, create, config, args.escape))
        }
        Some(Command::List) => {
            init_stderr_logging();
            runtime.block_on(run_list(&root))
        }
        Some(Command::Kill { session }) => {
            init_stderr_logging();
            run_kill(&root, &session)
        }
        None => {
            init_stderr_logging();
            runtime.block_on(run_list(&root))
        }
    }
}

/// The rendezvous root must exist and be private to the user.
fn ensure_root(root: &Path) -> eyre::Result<()> {
    if !root.exists() {
        std::fs::create_dir_all(root)?;
    }
    std::fs::set_permissions(root, std::fs::Permissions::from_mode(0o700))?;
    let mode = std::fs::metadata(root)?.permissions().mode() & 0o777;
    if mode != 0o700 {
        eyre::bail!("{} has mode {mode:o}, want 700", root.display());
    }
    Ok(())
}

/// `--internal +NAME` respawns itself detached and exits; `--internal
/// NAME` runs the server in this process. The two hops give the server
/// its own session, free of the spawning terminal.
fn run_internal(root: &Path, name: &str, config: tether_config::Config) -> eyre::Result<()> {
    if let Some(stripped) = name.strip_prefix('+') {
        let exe = std::env::current_exe()?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("--internal")
            .arg(stripped)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                nix::libc::setsid();
                Ok(())
            });
        }
        cmd.spawn().wrap_err("respawning server")?;
        return Ok(());
    }

    let session = Session::open(root, name)?;
    init_file_logging(&session.log_dir(), "server");
    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(tether_server::run(root, name, config))?;
    std::process::exit(code);
}

/// Start the server for `name` and wait for it to come up.
async fn spawn_server(name: &str) -> eyre::Result<()> {
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("--internal")
        .arg(format!("+{name}"))
        .stdin(std::process::Stdio::null())
        .spawn()
        .wrap_err("starting server")?;
    println!("Started session {name}");
    // The intermediate exits as soon as it has respawned; reap it and
    // give the real server a beat to start listening.
    tokio::task::spawn_blocking(move || {
        let mut child = child;
        let _ = child.wait();
    })
    .await
    .ok();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}

async fn run_new(
    root: &Path,
    name: &str,
    detach: bool,
    config: tether_config::Config,
    escape: Option<String>,
) -> eyre::Result<()> {
    let mut session = Session::open(root, name)?;
    if session.check().await {
        eyre::bail!("session name already in use");
    }
    Session::create(root, name)?;
    spawn_server(name).await?;
    if detach {
        return Ok(());
    }
    attach_session(root, name, true, config, escape).await
}

async fn run_attach(
    root: &Path,
    name: &str,
    create: bool,
    config: tether_config::Config,
    escape: Option<String>,
) -> eyre::Result<()> {
    let mut session = Session::open(root, name)?;
    if !session.check().await {
        if !create {
            eyre::bail!("no such session {name} — run `tether list`");
        }
        Session::create(root, name)?;
        spawn_server(name).await?;
        return attach_session(root, name, true, config, escape).await;
    }
    if let Some(count) = session.client_count() {
        if count > 0 {
            let plural = if count == 1 { "" } else { "s" };
            println!("Session has {count} client{plural}.");
        }
    }
    attach_session(root, name, false, config, escape).await
}

async fn attach_session(
    root: &Path,
    name: &str,
    just_started: bool,
    config: tether_config::Config,
    escape_flag: Option<String>,
) -> eyre::Result<()> {
    let session = Session::open(root, name)?;
    init_file_logging(&session.log_dir(), "client");

    let escape_spec = escape_flag.unwrap_or_else(|| config.escape.clone());
    let escape = tether_config::parse_escape_char(&escape_spec)
        .wrap_err_with(|| format!("invalid escape character {escape_spec:?}"))?;

    let code = tether_client::attach(
        session,
        config,
        tether_client::AttachOptions {
            escape,
            just_started,
        },
    )
    .await?;
    std::process::exit(code);
}

async fn run_list(root: &Path) -> eyre::Result<()> {
    let sessions = tether_session::sessions(root).await;
    println!("Found {} session{}:", sessions.len(), plural(sessions.len()));
    for session in sessions {
        println!(
            "  {} ({}) {}",
            session.name(),
            session.client_count().unwrap_or(0),
            session.title()
        );
    }
    Ok(())
}

fn run_kill(root: &Path, name: &str) -> eyre::Result<()> {
    let session = Session::open(root, name)?;
    if !session.exists() {
        eyre::bail!("no such session {name}");
    }
    if let Some(pid) = session.pid() {
        use nix::sys::signal::{kill, Signal};
        match kill(nix::unistd::Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => println!("Sent SIGTERM to session {name} (pid {pid})"),
            Err(e) => info!("kill {pid}: {e}"),
        }
    }
    session.remove();
    Ok(())
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Per-session file logging; the attached terminal is raw, so nothing
/// may reach stderr.
fn init_file_logging(log_dir: &PathBuf, which: &str) {
    if std::fs::create_dir_all(log_dir).is_err() {
        return;
    }
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = log_dir.join(format!("{which}-{timestamp}.log"));
    let Ok(file) = std::fs::File::create(&path) else {
        return;
    };
    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
