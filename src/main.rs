//! `plakar` binary: minimal argument handling and dispatch, either
//! through a running agent or in-process (agentless).

use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use plakar_cache::CacheManager;
use plakar_repository::Repository;

use plakar::agent::protocol::{CommandRequest, Request};
use plakar::agent::{client, daemon};
use plakar::commands;
use plakar::context::AppContext;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("PLAKAR_LOG", "warn")).init();

    std::process::exit(match run() {
        Ok(code) => code,
        Err(err) => {
            if plakar_types::is_cancelled(&err) {
                eprintln!("plakar: interrupted");
            } else {
                eprintln!("plakar: {:#}", err);
            }
            1
        }
    });
}

fn cache_base() -> Result<std::path::PathBuf, Error> {
    let xdg = xdg::BaseDirectories::with_prefix("plakar")?;
    Ok(xdg.get_cache_home())
}

fn run() -> Result<i32, Error> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut repository = std::env::var("PLAKAR_REPOSITORY").ok();
    let mut agentless = std::env::var("PLAKAR_AGENTLESS").is_ok();

    // global options come before the subcommand
    while let Some(first) = args.first().cloned() {
        match first.as_str() {
            "-at" | "-r" | "--repository" => {
                args.remove(0);
                if args.is_empty() {
                    bail!("missing repository location after {}", first);
                }
                repository = Some(args.remove(0));
            }
            "--agentless" => {
                args.remove(0);
                agentless = true;
            }
            _ => break,
        }
    }

    let Some(command) = args.first().cloned() else {
        usage();
        return Ok(1);
    };
    args.remove(0);

    let cache = Arc::new(CacheManager::new(cache_base()?));
    let secret = std::env::var("PLAKAR_PASSPHRASE").ok();

    match command.as_str() {
        "version" => {
            println!("plakar {}", plakar::VERSION);
            return Ok(0);
        }
        "help" | "-h" | "--help" => {
            usage();
            return Ok(0);
        }
        "agent" => return run_agent(cache, &args),
        "create" => return run_create(cache, repository, secret, &args),
        _ => {}
    }

    let location =
        repository.ok_or_else(|| format_err!("no repository specified (-at or PLAKAR_REPOSITORY)"))?;
    let request = Request {
        store_location: location,
        secret: secret.clone(),
        command: parse_command(&command, &args)?,
    };

    let socket = plakar::agent::socket_path(&cache_base()?);
    if !agentless && client::agent_available(&socket) {
        return client::run(&socket, &request);
    }

    let mut ctx = AppContext::new(cache);
    ctx.secret = secret;
    let ctx = Arc::new(ctx);
    install_interrupt_handler(&ctx);
    commands::execute(&ctx, &request, None)
}

fn run_agent(cache: Arc<CacheManager>, args: &[String]) -> Result<i32, Error> {
    let ctx = Arc::new(AppContext::new(cache));
    match args.first().map(String::as_str) {
        Some("start") => daemon::start(ctx, args.iter().any(|a| a == "--foreground")),
        Some("stop") => daemon::stop(ctx.cache.base()),
        Some("restart") => daemon::restart(ctx),
        _ => bail!("usage: plakar agent start|stop|restart"),
    }
}

fn run_create(
    cache: Arc<CacheManager>,
    repository: Option<String>,
    secret: Option<String>,
    args: &[String],
) -> Result<i32, Error> {
    let location = match args.iter().find(|a| !a.starts_with('-')) {
        Some(location) => location.clone(),
        None => repository
            .ok_or_else(|| format_err!("usage: plakar create [options] <location>"))?,
    };
    let plaintext = args.iter().any(|a| a == "--plaintext");
    let compression = !args.iter().any(|a| a == "--no-compression");

    let passphrase = if plaintext {
        None
    } else {
        match secret {
            Some(secret) => Some(secret),
            None => {
                let first = plakar::context::prompt_passphrase("repository passphrase: ")?;
                let second = plakar::context::prompt_passphrase("repository passphrase (again): ")?;
                if first != second {
                    bail!("passphrases do not match");
                }
                Some(first)
            }
        }
    };

    let ctx = AppContext::new(cache);
    let repo = Repository::create(
        &ctx.registry,
        &location,
        &ctx.cache,
        passphrase.as_deref(),
        compression,
    )?;
    println!("created repository {} at {}", repo.id(), location);
    repo.close()?;
    Ok(0)
}

fn parse_command(name: &str, args: &[String]) -> Result<CommandRequest, Error> {
    let mut flags: Vec<&str> = Vec::new();
    let mut values: Vec<String> = Vec::new();
    let mut tags: Vec<String> = Vec::new();
    let mut to: Option<String> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-t" | "--tag" => {
                tags.push(
                    iter.next()
                        .ok_or_else(|| format_err!("missing value after {}", arg))?
                        .clone(),
                );
            }
            "-to" | "--to" => {
                to = Some(
                    iter.next()
                        .ok_or_else(|| format_err!("missing value after {}", arg))?
                        .clone(),
                );
            }
            flag if flag.starts_with('-') => flags.push(arg.as_str()),
            _ => values.push(arg.clone()),
        }
    }
    let has = |flag: &str| flags.contains(&flag);
    let value = |idx: usize, what: &str| -> Result<String, Error> {
        values
            .get(idx)
            .cloned()
            .ok_or_else(|| format_err!("missing {} argument", what))
    };

    Ok(match name {
        "backup" => CommandRequest::Backup {
            path: value(0, "source path")?,
            tags,
        },
        "check" => CommandRequest::Check {
            snapshot: values.first().cloned(),
            fast: has("--fast"),
        },
        "ls" => match values.first() {
            Some(target) => {
                let (snapshot, path) = commands::parse_target(target)?;
                CommandRequest::Ls {
                    snapshot,
                    path: Some(path),
                    long: has("-l") || has("--long"),
                }
            }
            None => CommandRequest::Ls {
                snapshot: String::new(),
                path: None,
                long: has("-l") || has("--long"),
            },
        },
        "cat" => {
            let (snapshot, path) = commands::parse_target(&value(0, "snapshot:path")?)?;
            if path == "/" {
                bail!("usage: plakar cat <snapshot>:</path>");
            }
            CommandRequest::Cat { snapshot, path }
        }
        "restore" => {
            let (snapshot, path) = commands::parse_target(&value(0, "snapshot")?)?;
            CommandRequest::Restore {
                snapshot,
                path: Some(path),
                to: to.ok_or_else(|| format_err!("missing -to <directory>"))?,
            }
        }
        "rm" => {
            if values.is_empty() {
                bail!("usage: plakar rm <snapshot>...");
            }
            CommandRequest::Rm {
                snapshots: values.clone(),
            }
        }
        "info" => CommandRequest::Info {
            snapshot: values.first().cloned(),
        },
        "locate" => CommandRequest::Locate {
            pattern: value(0, "pattern")?,
        },
        "checksum" | "digest" => {
            if values.is_empty() {
                bail!("usage: plakar {} <snapshot>:</path>...", name);
            }
            let mut snapshot = None;
            let mut paths = Vec::new();
            for target in &values {
                let (snap, path) = commands::parse_target(target)?;
                match &snapshot {
                    None => snapshot = Some(snap),
                    Some(known) if *known != snap => {
                        bail!("all targets must reference the same snapshot");
                    }
                    Some(_) => {}
                }
                paths.push(path);
            }
            let snapshot = snapshot.unwrap();
            if name == "checksum" {
                CommandRequest::Checksum {
                    snapshot,
                    paths,
                    fast: has("--fast"),
                }
            } else {
                CommandRequest::Digest { snapshot, paths }
            }
        }
        "diff" => CommandRequest::Diff {
            old: value(0, "old snapshot")?,
            new: value(1, "new snapshot")?,
        },
        "sync" => CommandRequest::Sync {
            peer: value(0, "peer repository")?,
            peer_secret: None,
        },
        "clone" => CommandRequest::Clone {
            target: value(0, "target location")?,
        },
        "maintenance" | "cleanup" => CommandRequest::Maintenance {},
        other => bail!("unknown command '{}' (see 'plakar help')", other),
    })
}

static INTERRUPT_TOKEN: std::sync::OnceLock<plakar_types::CancelToken> =
    std::sync::OnceLock::new();

fn install_interrupt_handler(ctx: &Arc<AppContext>) {
    let _ = INTERRUPT_TOKEN.set(ctx.cancel.clone());
    unsafe {
        libc::signal(
            libc::SIGINT,
            interrupt_handler as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

extern "C" fn interrupt_handler(_signal: libc::c_int) {
    if let Some(token) = INTERRUPT_TOKEN.get() {
        token.cancel();
    }
}

fn usage() {
    eprintln!(
        "usage: plakar [-at <repository>] [--agentless] <command> [args]

commands:
    create [--plaintext] [--no-compression] <location>
    backup [-t tag] <path>
    ls [-l] [<snapshot>[:<path>]]
    cat <snapshot>:<path>
    checksum [--fast] <snapshot>:<path>...
    digest <snapshot>:<path>...
    restore <snapshot>[:<path>] -to <directory>
    check [--fast] [<snapshot>]
    diff <old> <new>
    locate <pattern>
    rm <snapshot>...
    sync <peer>
    clone <target>
    maintenance
    info [<snapshot>]
    agent start|stop|restart
    version"
    );
}
