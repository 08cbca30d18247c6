use clap::{Parser, Subcommand};
use gridroute_common::db::core::RouterDB;
use gridroute_common::db::{defout, parser};
use gridroute_common::util::{check, config::Config, logger};
use gridroute_router::Router;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Full flow: stage 1, then stage 2 passes, then write the routed DEF.
    Route {
        /// Route a single net by name.
        #[arg(long)]
        net: Option<String>,
        /// Stop cleanly after this many seconds, at the next net boundary.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Conflict-free routing only.
    Stage1 {
        #[arg(long)]
        net: Option<String>,
    },
    /// Rip-up-and-reroute over everything stage 1 left failing.
    Stage2 {
        #[arg(long)]
        net: Option<String>,
    },
    /// Rip up one net (or all of them) and write the result.
    Ripup {
        net: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Report the most heavily used grid cells after routing.
    Congested {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

fn main() -> anyhow::Result<()> {
    logger::init();
    let args = Args::parse();

    let config = if args.config.exists() {
        log::info!("loading configuration from {:?}", args.config);
        let text = std::fs::read_to_string(&args.config)?;
        Config::from_toml(&text).map_err(|e| anyhow::anyhow!("bad config: {}", e))?
    } else {
        log::warn!("configuration {:?} not found; using defaults", args.config);
        Config::default()
    };

    let command = args.command.unwrap_or(Commands::Route {
        net: None,
        timeout: None,
    });

    let failing = match command {
        Commands::Route { net, timeout } => {
            let mut router = load_router(config)?;
            if let Some(secs) = timeout {
                router.set_deadline(Instant::now() + Duration::from_secs(secs));
            }
            let failing = match lookup(&router, net.as_deref())? {
                Some(id) => {
                    let fail = router.stage1(Some(id));
                    if fail > 0 {
                        router.stage2(Some(id))
                    } else {
                        0
                    }
                }
                None => router.route(),
            };
            finish(&mut router)?;
            failing
        }
        Commands::Stage1 { net } => {
            let mut router = load_router(config)?;
            let id = lookup(&router, net.as_deref())?;
            let failing = router.stage1(id);
            finish(&mut router)?;
            failing
        }
        Commands::Stage2 { net } => {
            let mut router = load_router(config)?;
            let id = lookup(&router, net.as_deref())?;
            router.requeue_all(true);
            let failing = router.stage2(id);
            finish(&mut router)?;
            failing
        }
        Commands::Ripup { net, all } => {
            let mut router = load_router(config)?;
            if all {
                router.ripup_all();
            } else if let Some(id) = lookup(&router, net.as_deref())? {
                router.ripup(id);
            } else {
                anyhow::bail!("ripup requires a net name or --all");
            }
            write_output(&mut router)?;
            0
        }
        Commands::Congested { top } => {
            let mut router = load_router(config)?;
            let failing = router.route();
            for (c, count) in router.congestion(top) {
                log::info!(
                    "congestion: ({}, {}) layer {} used {} times",
                    c.x,
                    c.y,
                    c.layer,
                    count
                );
            }
            finish(&mut router)?;
            failing
        }
    };

    if failing > 0 {
        log::error!("{} nets failed to route", failing);
        std::process::exit(failing.min(127) as i32);
    }
    Ok(())
}

fn load_router(config: Config) -> anyhow::Result<Router> {
    let mut db = RouterDB::new();

    if config.input.lef_files.is_empty() {
        anyhow::bail!("no LEF files configured; set [input] lef_files");
    }
    for lef in &config.input.lef_files {
        if !Path::new(lef).exists() {
            anyhow::bail!("input LEF file missing: {}", lef);
        }
        log::info!("reading LEF {}", lef);
        parser::lef::parse(&mut db, lef)?;
    }

    let def = &config.input.def_file;
    if !Path::new(def).exists() {
        anyhow::bail!("input DEF file missing: {}", def);
    }
    log::info!("reading DEF {}", def);
    parser::def::parse(&mut db, def)?;

    Router::new(db, config).map_err(|e| anyhow::anyhow!(e))
}

fn lookup(
    router: &Router,
    net: Option<&str>,
) -> anyhow::Result<Option<gridroute_common::db::indices::NetId>> {
    match net {
        None => Ok(None),
        Some(name) => match router.db.find_net(name) {
            Some(id) => Ok(Some(id)),
            None => anyhow::bail!("no such net '{}'", name),
        },
    }
}

/// Verify, then write the routed layout. Partial results are still written
/// when verification or routing failed.
fn finish(router: &mut Router) -> anyhow::Result<()> {
    if let Err(e) = check::run(&router.db, router.config.router.max_stack) {
        log::error!("verification: {}", e);
    }
    write_output(router)
}

fn write_output(router: &mut Router) -> anyhow::Result<()> {
    let out = router.config.output.def_file.clone();
    if let Some(parent) = Path::new(&out).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    log::info!("writing routed DEF to {}", out);
    defout::write(
        &router.db,
        &router.frame(),
        router.config.router.via_pattern,
        &out,
    )?;
    Ok(())
}
