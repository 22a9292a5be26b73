use anyhow::{bail, Context, Result};
use colored::*;
use env_logger::{Builder, Env, Target};
use log::info;
use msgscan::autoscan::AutoScanner;
use msgscan::cli::{Cli, Commands, SearchMode};
use msgscan::config::Config;
use msgscan::model::{ChannelId, Message, MessageId, Pattern, Scope, SearchSpec, UserId};
use msgscan::platform::ArchivePlatform;
use msgscan::search::{ScanEngine, ScanOutcome};
use msgscan::stats::StatsStore;
use msgscan::Parser;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;
    info!("Application started with command: {:?}", cli.command);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match &cli.command {
        Commands::Search {
            query,
            mode,
            strictness,
            user,
            channels,
            include,
            exclude,
            depth,
            deep,
            refresh,
            timeout,
            show,
            metrics,
            requester,
        } => {
            let engine = open_engine(&cli, &config)?;
            let pattern = match (mode, query) {
                (SearchMode::Badword, _) => Pattern::BadWordList((*strictness).into()),
                (SearchMode::Keyword, Some(q)) => Pattern::Keyword(q.clone()),
                (SearchMode::Regex, Some(q)) => Pattern::Regex(q.clone()),
                (_, None) => bail!("{mode} search needs a query"),
            };
            let scope = match (user, channels) {
                (Some(user), _) => Scope::User(UserId(*user)),
                (None, Some(ids)) => {
                    Scope::ChannelSet(ids.iter().copied().map(ChannelId).collect())
                }
                (None, None) => Scope::All,
            };
            let mut spec = SearchSpec::new(scope, pattern, *depth)
                .deep(*deep)
                .force_refresh(*refresh);
            if let Some(ids) = include {
                spec = spec.include(ids.iter().copied().map(ChannelId));
            }
            if let Some(ids) = exclude {
                spec = spec.exclude(ids.iter().copied().map(ChannelId));
            }
            if let Some(user) = requester {
                spec = spec.requested_by(UserId(*user));
            }

            let outcome = match timeout {
                Some(secs) => {
                    let deadline = tokio::time::Instant::now() + Duration::from_secs(*secs);
                    engine.run_until(&spec, deadline).await?
                }
                None => engine.run(&spec).await?,
            };
            print_outcome(&outcome, *show);
            if *metrics {
                println!("\n{}", engine.metrics().gather());
            }
            engine.stats().flush();
        }

        Commands::Context {
            channel,
            message,
            radius,
        } => {
            let engine = open_engine(&cli, &config)?;
            let (target, context) = engine
                .message_context(ChannelId(*channel), MessageId(*message), *radius)
                .await?;
            for m in &context {
                if m.timestamp <= target.timestamp {
                    println!("  {}", format_message(m).dimmed());
                }
            }
            println!("> {}", format_message(&target).bold());
            for m in &context {
                if m.timestamp > target.timestamp {
                    println!("  {}", format_message(m).dimmed());
                }
            }
            engine.stats().flush();
        }

        Commands::Members { strictness } => {
            let engine = open_engine(&cli, &config)?;
            let hits = engine.scan_members((*strictness).into()).await?;
            if hits.is_empty() {
                println!("{}", "No member names matched".yellow());
            }
            for hit in &hits {
                println!(
                    "{} ({}) {}",
                    hit.member.name,
                    hit.member.id,
                    format!("'{}' [{}]", hit.matched_name, hit.match_reason).cyan()
                );
            }
        }

        Commands::Stats { reset } => {
            let store = StatsStore::open(&config.stats.path)?;
            if *reset {
                store.reset();
                println!("{}", "Search statistics reset".green());
                return Ok(());
            }
            let stats = store.snapshot();
            println!("{}", "Search statistics".green().bold());
            println!("  Total searches:      {}", stats.total_searches);
            println!("  Deep searches:       {}", stats.deep_searches);
            println!("  Cancelled searches:  {}", stats.cancelled_searches);
            println!("  Messages scanned:    {}", stats.total_messages_scanned);
            println!("  Matches found:       {}", stats.total_matches);
            println!(
                "  Avg messages/search: {:.1}",
                stats.average_messages_per_search()
            );
            println!("  Largest search:      {}", stats.largest_search);
            println!(
                "  Total search time:   {:.1}s",
                stats.total_search_time_ms as f64 / 1000.0
            );
            println!(
                "  Cache hits/misses:   {}/{}",
                stats.cache_hits, stats.cache_misses
            );
            if let Some(last) = &stats.last_search {
                let by = last
                    .requester
                    .map(|u| format!(" by {u}"))
                    .unwrap_or_default();
                println!(
                    "  Last search:         {}{by} at {} ({} match(es))",
                    last.query,
                    last.at.format("%Y-%m-%d %H:%M:%S"),
                    last.matches_found
                );
            }
            for (user, count) in &stats.searches_by_user {
                println!("  Searches by {user}: {count}");
            }
            if let Some(path) = store.path() {
                println!("  Stats file:          {}", path.display());
            }
        }

        Commands::Watch {
            interval,
            runs,
            depth,
            strictness,
        } => {
            let engine = Arc::new(open_engine(&cli, &config)?);
            let mut settings = config.autoscan.clone();
            settings.enabled = true;
            settings.interval_minutes = *interval;
            settings.depth_limit = *depth;
            settings.strictness = (*strictness).into();
            let scanner = Arc::new(AutoScanner::new(engine.clone(), &settings)?);

            println!(
                "{} every {} minute(s), {} run(s)",
                "Auto-scan".green().bold(),
                interval,
                runs
            );
            let driver = scanner.start();
            scanner.run_now().await;
            while scanner.status().runs_completed < *runs {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            scanner.shutdown();
            driver.await.context("Auto-scan task failed")?;

            for report in scanner.recent_runs() {
                let line = format!(
                    "{} run: {} match(es) in {} message(s), {} member name(s) over {:.1}s",
                    report.started_at.format("%Y-%m-%d %H:%M:%S"),
                    report.matches,
                    report.messages_scanned,
                    report.member_matches,
                    report.elapsed().as_secs_f64()
                );
                match &report.error {
                    Some(e) => println!("{} ({})", line.red(), e),
                    None => println!("{line}"),
                }
            }
            for finding in scanner.findings() {
                println!("{}", finding.to_string().yellow());
            }
            engine.stats().flush();
        }
    }

    Ok(())
}

fn open_engine(cli: &Cli, config: &Config) -> Result<ScanEngine> {
    let Some(path) = &cli.archive else {
        bail!("--archive <file.json> is required for this command");
    };
    let platform = ArchivePlatform::load(path)?;
    let engine = ScanEngine::from_config(config, Arc::new(platform))?;
    engine.stats().spawn_flusher(config.stats.flush_interval());
    Ok(engine)
}

fn format_message(m: &Message) -> String {
    format!(
        "{} #{} {}: {}",
        m.timestamp.format("%Y-%m-%d %H:%M:%S"),
        m.channel_id,
        m.author_name,
        m.content
    )
}

fn print_outcome(outcome: &ScanOutcome, show: usize) {
    if outcome.results.is_empty() {
        println!("{}", "No matches found".yellow());
    } else {
        println!(
            "\n{} {} {}",
            "Found".green(),
            outcome.matches_found,
            "matches:".green()
        );
        for result in outcome.results.iter().take(show) {
            println!(
                "{}  {}",
                format_message(&result.message),
                format!("[{}]", result.match_reason).cyan()
            );
            for m in &result.context {
                println!("    {}", format_message(m).dimmed());
            }
        }
        if outcome.results.len() > show {
            println!("... {} more", outcome.results.len() - show);
        }
    }

    println!(
        "\nScanned {} message(s) in {} channel(s) in {:.2}s",
        outcome.messages_scanned,
        outcome.channels.len(),
        outcome.elapsed.as_secs_f64()
    );
    if outcome.truncated {
        println!("{}", "Result cap reached; older matches dropped".yellow());
    }
    if outcome.incomplete {
        println!(
            "{}",
            format!(
                "Search incomplete: {} channel(s) not finished",
                outcome.channels_abandoned
            )
            .yellow()
        );
    }
    for skipped in outcome.skipped_channels() {
        if let Some(e) = &skipped.error {
            eprintln!("{} #{}: {}", "Skipped".red(), skipped.name, e);
        }
    }
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_level));

    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(
            buf,
            "{} [{}] [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.module_path().unwrap_or("unknown"),
            record.args()
        )
    });

    if let Some(log_path) = &cli.log {
        if let Some(parent_dir) = log_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                fs::create_dir_all(parent_dir).with_context(|| {
                    format!("Failed to create log directory: {}", parent_dir.display())
                })?;
            }
        }
        let log_file = fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
        builder.target(Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(Target::Stderr);
    }

    builder
        .try_init()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}
