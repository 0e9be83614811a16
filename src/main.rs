use std::path::{
    Path,
    PathBuf,
};

use clap::{
    Parser,
    Subcommand,
};
use decksmith::{
    build::{
        build,
        BuildOptions,
    },
    config,
    core::DecksmithError,
    guid,
    import::{
        import_deck,
        ImportOptions,
    },
    source,
};

#[derive(Parser, Debug)]
#[clap(name = "decksmith", version)]
#[clap(about = "Source-format manager for CrowdAnki decks")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build CrowdAnki export directories from the source tree
    Build {
        /// Deck to build (repeatable; default: every deck under decks/)
        #[clap(long)]
        deck: Vec<String>,

        /// Restrict the build to a single language
        #[clap(long)]
        lang: Option<String>,

        /// Source tree directory
        #[clap(long, default_value = "src")]
        src: PathBuf,

        /// Output directory (default: build)
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Assign or refresh stable note guids without building
    Index {
        /// Re-derive every token instead of reusing persisted ones
        #[clap(long)]
        full: bool,

        /// Source tree directory
        #[clap(long, default_value = "src")]
        src: PathBuf,
    },

    /// Pull an exported CrowdAnki deck back into source form
    Import {
        /// Exported deck directory
        path: PathBuf,

        /// Source tree directory to create
        #[clap(long, default_value = "src")]
        src: PathBuf,

        /// Override the deck name recorded in the export
        #[clap(long)]
        deck: Option<String>,
    },
}

fn index(full: bool, src_dir: &Path) -> Result<(), DecksmithError> {
    let project = config::load_project_config(src_dir)?;
    let mut notes = source::load_notes(&project)?;
    let result = guid::assign_note_guids(&mut notes, src_dir, full)?;

    let file = result.path.file_name().map(|n| n.to_string_lossy().into_owned());
    let file = file.as_deref().unwrap_or(guid::GUID_MAP_FILE);
    if result.changed {
        println!("Successfully reindexed '{}'", file);
    } else {
        println!("No guid changes needed in '{}'", file);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), DecksmithError> {
    match cli.command {
        Command::Build { deck, lang, src, out } => {
            build(&BuildOptions { decks: deck, lang, src_dir: src, build_dir: out })
        }
        Command::Index { full, src } => index(full, &src),
        Command::Import { path, src, deck } => {
            import_deck(&ImportOptions { path, target_dir: src, deck })
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
}
