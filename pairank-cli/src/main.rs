mod config;
mod output;
mod prompt;
mod store;

use clap::Parser;
use pairank_core::{
    BatchReport, BatchStep, CancelOutcome, CandidateItem, CurrentComparison, EngineConfig, ItemId, OrderedStore, Placement,
    PolicyConfig, RankError, RankingEngine, RebuildStep, RebuildWorkflow, RetryConfig, SessionHandle, UndoOutcome,
    UserId,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::prompt::{Choice, Prompter, Recovery};
use crate::store::JsonFileStore;

pub fn bail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// Log the full error, then exit with the short user-facing message.
fn fatal(e: RankError) -> ! {
    error!(error = %e, "giving up");
    bail(e.user_message())
}

/// Failures that leave a decided placement waiting are handled by the
/// recovery prompt on the next step; anything else ends the run.
fn settle<T>(result: Result<T, RankError>) {
    if let Err(e) = result {
        if !e.is_retryable() {
            fatal(e);
        }
    }
}

#[derive(Parser)]
#[command(name = "pairank", version, about = "Rank your games one \"which do you prefer?\" at a time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default: ~/.config/pairank/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the JSON store (default: ~/.config/pairank/store.json)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Whose ranking to work on
    #[arg(long, global = true)]
    user: Option<String>,

    /// Show debug logs on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create a default config file at ~/.config/pairank/config.toml
    Init,
    /// Show the current ranking
    List {
        /// Output JSON instead of table
        #[arg(long)]
        json: bool,
    },
    /// Add one game, placing it by pairwise comparisons
    Add(AddArgs),
    /// Add many games in one session
    Batch {
        /// File with one title per line, or a JSON array of titles
        #[arg(long)]
        items: PathBuf,
    },
    /// Place an already ranked game again from scratch
    Rerank {
        #[arg(long)]
        item: String,
    },
    /// Remove a game from the ranking
    Remove {
        #[arg(long)]
        item: String,
    },
    /// Shuffle everything and rebuild the ranking from scratch
    Rebuild {
        /// Continue an interrupted rebuild instead of starting over
        #[arg(long)]
        resume: bool,
    },
}

#[derive(clap::Args)]
struct AddArgs {
    #[arg(long)]
    title: String,

    /// Cover image URL
    #[arg(long)]
    cover: Option<String>,

    /// Id in an external catalog (e.g. igdb:1942)
    #[arg(long)]
    external_id: Option<String>,

    /// Item id (default: derived from the title)
    #[arg(long)]
    id: Option<String>,
}

struct Context {
    store: Arc<JsonFileStore>,
    user: UserId,
    engine: EngineConfig,
}

impl Context {
    fn engine(&self) -> RankingEngine<JsonFileStore> {
        RankingEngine::new(self.store.clone(), self.user.clone(), self.engine.clone())
    }

    async fn ranked_with_titles(&self) -> (Vec<pairank_core::RankedItem>, Vec<CandidateItem>) {
        let ranked = self.store.fetch_ranked_items(&self.user).await.unwrap_or_else(|e| fatal(e.into()));
        let items = self.store.candidates(ranked.iter().map(|r| &r.item_id)).await;
        (ranked, items)
    }

    async fn title_of(&self, item: &ItemId) -> String {
        self.store.lookup(item).await.map(|c| c.title).unwrap_or_else(|| item.to_string())
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn build_context(cli: &Cli) -> Context {
    // Load config file, merge with CLI args (CLI wins)
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let cfg = config::load_config(&config_path);

    let store_path = cli.store.clone().or(cfg.store).unwrap_or_else(config::default_store_path);
    let store = JsonFileStore::open(&config::expand_home(&store_path)).unwrap_or_else(|e| bail(e));
    let user = cli.user.clone().or(cfg.user).unwrap_or_else(|| "me".to_string());

    let max_comparisons = cfg.max_comparisons.unwrap_or(PolicyConfig::default().max_comparisons);
    if max_comparisons == 0 {
        bail(format!("max_comparisons must be at least 1 (in {})", config_path.display()));
    }
    let mut retry = RetryConfig::default();
    if let Some(retries) = cfg.retries {
        retry.max_attempts = retries.max(1);
    }

    Context {
        store: Arc::new(store),
        user: UserId::new(user),
        engine: EngineConfig { policy: PolicyConfig { max_comparisons }, retry },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Init = cli.command {
        let path = cli.config.clone().unwrap_or_else(config::config_path);
        config::create_default_config(&path);
        println!("Created config at {}", path.display());
        println!("Edit it to set your store path, user, etc.");
        return;
    }

    let ctx = build_context(&cli);
    let mut prompter = Prompter::new(io::stdin().lock(), io::stdout());

    match cli.command {
        Commands::Init => {}
        Commands::List { json } => {
            let (ranked, items) = ctx.ranked_with_titles().await;
            if json {
                output::print_json(ctx.user.as_str(), &ranked, &items);
            } else {
                output::print_table(&ranked, &items);
            }
        }
        Commands::Add(args) => run_add(&ctx, args, &mut prompter).await,
        Commands::Batch { items } => {
            let content = std::fs::read_to_string(&items)
                .unwrap_or_else(|e| bail(format!("Failed to read items file {}: {e}", items.display())));
            let titles = parse_items_from_str(&content);
            if titles.is_empty() {
                bail(format!("No items found in {}", items.display()));
            }
            run_batch(&ctx, titles, &mut prompter).await;
        }
        Commands::Rerank { item } => run_rerank(&ctx, ItemId::new(item), &mut prompter).await,
        Commands::Remove { item } => {
            let item = ItemId::new(item);
            let title = ctx.title_of(&item).await;
            let position = ctx.engine().remove_item(&item).await.unwrap_or_else(|e| fatal(e));
            if let Err(e) = ctx.store.forget(&item).await {
                warn!(item = %item, error = %e, "failed to drop catalog entry");
            }
            println!("Removed {title} (was #{position})");
        }
        Commands::Rebuild { resume } => run_rebuild(&ctx, resume, &mut prompter).await,
    }
}

/// Parse a string as either a JSON array of strings or plain text (one item per line).
fn parse_items_from_str(content: &str) -> Vec<String> {
    let trimmed = content.trim();
    if trimmed.starts_with('[') {
        let items: Vec<String> = serde_json::from_str(trimmed)
            .unwrap_or_else(|e| bail(format!("File looks like JSON but failed to parse: {e}")));
        items.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
    } else {
        trimmed
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Lowercase alphanumeric runs joined by '-': "Hades II" -> "hades-ii".
fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() { "item".to_string() } else { slug.to_string() }
}

/// A catalog id for `title` that isn't taken yet.
async fn fresh_id(store: &JsonFileStore, title: &str) -> ItemId {
    let base = slugify(title);
    let mut id = ItemId::new(base.clone());
    let mut n = 2;
    while store.contains(&id).await {
        id = ItemId::new(format!("{base}-{n}"));
        n += 1;
    }
    id
}

fn describe(placement: Placement) -> String {
    if placement.approximate {
        format!("#{} (approximate, comparison limit reached)", placement.position)
    } else {
        format!("#{}", placement.position)
    }
}

/// How one placement ended.
enum Finish {
    Placed(Placement),
    Cancelled,
    /// Quit while a re-rank's old row was already gone; the item is unranked.
    Unsaved,
}

/// Run the comparisons for one handle until its position is saved.
async fn drive_placement<R: BufRead, W: Write>(
    ctx: &Context,
    engine: &mut RankingEngine<JsonFileStore>,
    handle: SessionHandle,
    prompter: &mut Prompter<R, W>,
) -> Finish {
    let mut warned = false;
    loop {
        match engine.current_comparison(handle).unwrap_or_else(|e| fatal(e)) {
            CurrentComparison::Pending { candidate, opponent } => {
                let opponent_title = ctx.title_of(&opponent.item_id).await;
                match prompter.choose(None, &candidate.title, &opponent_title) {
                    choice @ (Choice::First | Choice::Second) => {
                        settle(engine.resolve_comparison(handle, choice == Choice::First).await)
                    }
                    Choice::Undo => match engine.undo(handle) {
                        Ok(UndoOutcome::Restored(_)) => {}
                        Ok(UndoOutcome::WorkflowLevelUndoRequired) => prompter.say("Nothing to undo."),
                        Err(e) => fatal(e),
                    },
                    Choice::Quit => {
                        return match engine.cancel(handle) {
                            CancelOutcome::SaveRequired => Finish::Unsaved,
                            _ => Finish::Cancelled,
                        };
                    }
                }
            }
            CurrentComparison::Terminal { placement, persisted: true } => {
                engine.cancel(handle);
                return Finish::Placed(placement);
            }
            CurrentComparison::Terminal { persisted: false, .. } => {
                match prompter.recover("Couldn't save. Try again.", false) {
                    Recovery::Retry => settle(engine.retry(handle).await),
                    Recovery::Skip | Recovery::Quit => match engine.cancel(handle) {
                        CancelOutcome::SaveRequired if !warned => {
                            prompter.say("Its old position is already cleared. Quitting now leaves it out of your ranking.");
                            warned = true;
                        }
                        CancelOutcome::SaveRequired => return Finish::Unsaved,
                        _ => return Finish::Cancelled,
                    },
                }
            }
        }
    }
}

async fn run_add<R: BufRead, W: Write>(ctx: &Context, args: AddArgs, prompter: &mut Prompter<R, W>) {
    let id = match args.id {
        Some(id) => ItemId::new(id),
        None => fresh_id(&ctx.store, &args.title).await,
    };
    let ranked = ctx.store.fetch_ranked_items(&ctx.user).await.unwrap_or_else(|e| fatal(e.into()));
    if ranked.iter().any(|r| r.item_id == id) {
        fatal(RankError::AlreadyRanked(id));
    }

    let candidate = CandidateItem {
        item_id: id.clone(),
        title: args.title,
        cover: args.cover,
        external_id: args.external_id,
    };
    let title = candidate.title.clone();
    ctx.store.register(candidate.clone()).await.unwrap_or_else(|e| fatal(e.into()));

    let mut engine = ctx.engine();
    let handle = engine.begin_insertion(candidate).await.unwrap_or_else(|e| fatal(e));
    match drive_placement(ctx, &mut engine, handle, prompter).await {
        Finish::Placed(placement) => prompter.say(format_args!("Placed {title} at {} (id: {id})", describe(placement))),
        Finish::Cancelled | Finish::Unsaved => {
            if let Err(e) = ctx.store.forget(&id).await {
                warn!(item = %id, error = %e, "failed to drop catalog entry");
            }
            prompter.say("Cancelled. Nothing was saved.");
        }
    }
}

async fn run_rerank<R: BufRead, W: Write>(ctx: &Context, item: ItemId, prompter: &mut Prompter<R, W>) {
    let ranked = ctx.store.fetch_ranked_items(&ctx.user).await.unwrap_or_else(|e| fatal(e.into()));
    let Some(old) = ranked.iter().find(|r| r.item_id == item).map(|r| r.position) else {
        fatal(RankError::UnknownItem(item));
    };
    let candidate = ctx
        .store
        .lookup(&item)
        .await
        .unwrap_or_else(|| CandidateItem::new(item.clone(), item.to_string()));
    let title = candidate.title.clone();

    let mut engine = ctx.engine();
    let handle = engine.begin_rerank(candidate).await.unwrap_or_else(|e| fatal(e));
    match drive_placement(ctx, &mut engine, handle, prompter).await {
        Finish::Placed(placement) => prompter.say(format_args!("Moved {title} from #{old} to {}", describe(placement))),
        Finish::Cancelled => prompter.say(format_args!("Cancelled. {title} stays at #{old}.")),
        Finish::Unsaved => {
            warn!(item = %item, old, "re-rank abandoned after its old row was removed");
            prompter.say(format_args!(
                "Warning: {title} is no longer in your ranking. Add it back with `pairank add --id {item} --title \"{title}\"`."
            ));
        }
    }
}

fn batch_summary(report: &BatchReport) -> String {
    let mut out = format!("Placed {} games", report.succeeded());
    if !report.skipped.is_empty() {
        let titles: Vec<&str> = report.skipped.iter().map(|c| c.title.as_str()).collect();
        out.push_str(&format!(", skipped {}: {}", titles.len(), titles.join(", ")));
    }
    out
}

async fn run_batch<R: BufRead, W: Write>(ctx: &Context, titles: Vec<String>, prompter: &mut Prompter<R, W>) {
    let mut candidates = Vec::with_capacity(titles.len());
    for title in titles {
        let candidate = CandidateItem::new(fresh_id(&ctx.store, &title).await, title);
        ctx.store.register(candidate.clone()).await.unwrap_or_else(|e| fatal(e.into()));
        candidates.push(candidate);
    }

    let engine = ctx.engine();
    let mut workflow = engine.begin_batch(candidates).await.unwrap_or_else(|e| fatal(e));
    loop {
        let progress = workflow.progress();
        match workflow.current_step() {
            BatchStep::Compare { candidate, opponent } => {
                let opponent_title = ctx.title_of(&opponent.item_id).await;
                match prompter.choose(Some((progress.current, progress.total)), &candidate.title, &opponent_title) {
                    choice @ (Choice::First | Choice::Second) => {
                        settle(workflow.resolve_comparison(choice == Choice::First).await)
                    }
                    Choice::Undo => match workflow.undo_last().await {
                        Ok(true) => {}
                        Ok(false) => prompter.say("Nothing to undo."),
                        Err(e) => settle::<()>(Err(e)),
                    },
                    Choice::Quit => {
                        let report = workflow.cancel();
                        prompter.say(format_args!("Stopped. {}", batch_summary(&report)));
                        return;
                    }
                }
            }
            BatchStep::Waiting { candidate, .. } => {
                let message = format!("Couldn't save {}. Try again, or skip it.", candidate.title);
                match prompter.recover(&message, true) {
                    Recovery::Retry => settle(workflow.retry().await),
                    Recovery::Skip => settle(workflow.skip().await),
                    Recovery::Quit => {
                        let report = workflow.cancel();
                        prompter.say(format_args!("Stopped. {}", batch_summary(&report)));
                        return;
                    }
                }
            }
            BatchStep::Complete(report) => {
                prompter.say(batch_summary(&report));
                return;
            }
        }
    }
}

async fn run_rebuild<R: BufRead, W: Write>(ctx: &Context, resume: bool, prompter: &mut Prompter<R, W>) {
    let interrupted = RebuildWorkflow::needs_resume(ctx.store.as_ref(), &ctx.user)
        .await
        .unwrap_or_else(|e| fatal(e));
    if resume && !interrupted {
        bail("No interrupted rebuild to resume.");
    }

    let ranked = ctx.store.fetch_ranked_items(&ctx.user).await.unwrap_or_else(|e| fatal(e.into()));
    let unranked = ctx.store.fetch_unranked_items(&ctx.user).await.unwrap_or_else(|e| fatal(e.into()));
    let items = ctx.store.candidates(ranked.iter().map(|r| &r.item_id).chain(unranked.iter())).await;

    let engine = ctx.engine();
    let mut rng = rand::rng();
    let started = if resume {
        engine.resume_rebuild(items, &mut rng).await
    } else {
        engine.begin_rebuild(items, &mut rng).await
    };
    let mut workflow = started.unwrap_or_else(|e| fatal(e));

    loop {
        let progress = workflow.progress();
        let (first, second) = match workflow.current_step() {
            RebuildStep::Bootstrap { first, second } => (first.title, second.title),
            RebuildStep::Compare { candidate, opponent, .. } => (candidate.title, opponent.title),
            RebuildStep::Waiting { candidate } => {
                let message = format!("Couldn't save {}. Try again.", candidate.title);
                match prompter.recover(&message, false) {
                    Recovery::Retry => settle(workflow.retry().await),
                    Recovery::Skip | Recovery::Quit => break,
                }
                continue;
            }
            RebuildStep::Complete(_) => break,
        };
        match prompter.choose(Some((progress.current, progress.total)), &first, &second) {
            choice @ (Choice::First | Choice::Second) => {
                settle(workflow.resolve_comparison(choice == Choice::First).await)
            }
            Choice::Undo => match workflow.undo_last().await {
                Ok(true) => {}
                Ok(false) => prompter.say("Nothing to undo."),
                Err(e) => settle::<()>(Err(e)),
            },
            Choice::Quit => break,
        }
    }

    match workflow.take_completion() {
        Some(summary) => {
            prompter.say(format_args!("Rebuilt {} games with {} comparisons.", summary.total, summary.comparisons));
            let (ranked, items) = ctx.ranked_with_titles().await;
            output::print_table(&ranked, &items);
        }
        None => prompter.say("Rebuild paused. Run `pairank rebuild --resume` to continue."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn context(dir: &tempfile::TempDir) -> Context {
        let store = JsonFileStore::open(&dir.path().join("store.json")).unwrap();
        Context {
            store: Arc::new(store),
            user: UserId::new("me"),
            engine: EngineConfig { policy: PolicyConfig::default(), retry: RetryConfig::immediate(2) },
        }
    }

    fn scripted(answers: &str) -> Prompter<Cursor<String>, Vec<u8>> {
        Prompter::new(Cursor::new(answers.to_string()), Vec::new())
    }

    async fn titles(ctx: &Context) -> Vec<String> {
        ctx.ranked_with_titles().await.1.into_iter().map(|c| c.title).collect()
    }

    fn add_args(title: &str) -> AddArgs {
        AddArgs { title: title.to_string(), cover: None, external_id: None, id: None }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hades II"), "hades-ii");
        assert_eq!(slugify("  The Legend of Zelda: Breath of the Wild "), "the-legend-of-zelda-breath-of-the-wild");
        assert_eq!(slugify("!!!"), "item");
    }

    #[test]
    fn test_parse_items_from_str() {
        assert_eq!(parse_items_from_str("Hades\n\n  Doom \n"), vec!["Hades", "Doom"]);
        assert_eq!(parse_items_from_str("[\"Hades\", \" \", \"Doom\"]"), vec!["Hades", "Doom"]);
    }

    #[tokio::test]
    async fn test_fresh_id_avoids_taken_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        ctx.store.register(CandidateItem::new("doom", "Doom")).await.unwrap();
        assert_eq!(fresh_id(&ctx.store, "Doom").await, ItemId::new("doom-2"));
        assert_eq!(fresh_id(&ctx.store, "Hades").await, ItemId::new("hades"));
    }

    #[tokio::test]
    async fn test_add_places_by_answers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        // Empty list: no questions.
        run_add(&ctx, add_args("Doom"), &mut scripted("")).await;
        // Hades vs Doom: prefer Hades.
        run_add(&ctx, add_args("Hades"), &mut scripted("1\n")).await;
        // Tetris vs Hades: prefer Hades. Tetris vs Doom: prefer Tetris.
        run_add(&ctx, add_args("Tetris"), &mut scripted("2\n1\n")).await;
        assert_eq!(titles(&ctx).await, vec!["Hades", "Tetris", "Doom"]);
    }

    #[tokio::test]
    async fn test_quit_add_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        run_add(&ctx, add_args("Doom"), &mut scripted("")).await;
        run_add(&ctx, add_args("Hades"), &mut scripted("q\n")).await;
        assert_eq!(titles(&ctx).await, vec!["Doom"]);
        assert!(!ctx.store.contains(&ItemId::new("hades")).await);
    }

    #[tokio::test]
    async fn test_batch_then_rerank() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let games = vec!["Doom".to_string(), "Hades".to_string(), "Tetris".to_string()];
        // Hades vs Doom -> Hades; Tetris vs Hades -> Hades; Tetris vs Doom -> Doom.
        run_batch(&ctx, games, &mut scripted("1\n2\n2\n")).await;
        assert_eq!(titles(&ctx).await, vec!["Hades", "Doom", "Tetris"]);

        // Tetris against [Hades, Doom]: pivot Hades -> Tetris wins.
        run_rerank(&ctx, ItemId::new("tetris"), &mut scripted("1\n")).await;
        assert_eq!(titles(&ctx).await, vec!["Tetris", "Hades", "Doom"]);
    }

    #[tokio::test]
    async fn test_batch_undo_reasks_previous_game() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let games = vec!["Doom".to_string(), "Hades".to_string(), "Tetris".to_string()];
        // Hades loses to Doom. Undo at Tetris's first question takes Hades back out.
        run_batch(&ctx, games, &mut scripted("2\nu\n1\n2\n2\n")).await;
        assert_eq!(titles(&ctx).await, vec!["Hades", "Doom", "Tetris"]);
    }

    #[tokio::test]
    async fn test_interrupted_rebuild_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        run_batch(&ctx, vec!["Doom".to_string(), "Hades".to_string(), "Tetris".to_string()], &mut scripted("1\n1\n"))
            .await;
        assert_eq!(ctx.store.fetch_ranked_items(&ctx.user).await.unwrap().len(), 3);

        // Answer the bootstrap, then stop.
        run_rebuild(&ctx, false, &mut scripted("1\nq\n")).await;
        assert!(RebuildWorkflow::needs_resume(ctx.store.as_ref(), &ctx.user).await.unwrap());
        assert_eq!(ctx.store.fetch_ranked_items(&ctx.user).await.unwrap().len(), 2);

        // Always prefer the game being placed: at most two questions remain.
        run_rebuild(&ctx, true, &mut scripted("1\n1\n")).await;
        assert!(!RebuildWorkflow::needs_resume(ctx.store.as_ref(), &ctx.user).await.unwrap());
        assert_eq!(ctx.store.fetch_ranked_items(&ctx.user).await.unwrap().len(), 3);
    }
}
