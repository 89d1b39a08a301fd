// Copyright (c) 2024-present
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A small REPL for inspecting and driving a `MemoryDigestStore`-backed hash-tree,
//! mirroring the teacher crate's own `tool` binary: `clap` for one-shot subcommands,
//! `rustyline` for an interactive session when invoked with no arguments.

use clap::{Parser, Subcommand};
use hash_tree::{
    DigestStore, FixedTreeId, FullRebuildMode, HashTree, HashTreeConfig, MemoryDigestStore, MemoryUserStore, TreeId,
    UserStore,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hashtree", about = "Inspect and drive an in-process hash-tree engine")]
struct Cli {
    /// Logical tree id every command operates against.
    #[arg(long, default_value_t = 1)]
    tree: TreeId,

    /// Number of segments the tree is partitioned into.
    #[arg(long, default_value_t = 1 << 10)]
    segments: u32,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Writes a key/value pair.
    Put { key: String, value: String },
    /// Removes a key.
    Rm { key: String },
    /// Reads a key's current value.
    Get { key: String },
    /// Dumps a segment's stored `(key, digest)` pairs.
    Segment { seg_id: u32 },
    /// Runs a full rebuild and prints the number of segments processed.
    Rebuild,
    /// Lists currently-dirty segments.
    Dirty,
}

type Engine = HashTree<MemoryDigestStore, MemoryUserStore>;

fn new_engine(tree_id: TreeId, segments: u32) -> Arc<Engine> {
    let config = HashTreeConfig::new()
        .no_of_segments(segments)
        .tree_id_provider(Arc::new(FixedTreeId(tree_id)))
        .build()
        .expect("default configuration is always valid");

    HashTree::new(config, MemoryDigestStore::new(), MemoryUserStore::single_tree(tree_id))
}

fn run_command(engine: &Engine, tree_id: TreeId, command: &Command) {
    match command {
        Command::Put { key, value } => match engine.h_put(key.as_bytes(), value.as_bytes()) {
            Ok(()) => println!("ok"),
            Err(e) => eprintln!("error: {e}"),
        },
        Command::Rm { key } => match engine.h_remove(key.as_bytes()) {
            Ok(()) => println!("ok"),
            Err(e) => eprintln!("error: {e}"),
        },
        Command::Get { key } => match engine.user_store().get(key.as_bytes()) {
            Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
            Ok(None) => println!("(not found)"),
            Err(e) => eprintln!("error: {e}"),
        },
        Command::Segment { seg_id } => match engine.get_segment(tree_id, *seg_id) {
            Ok(entries) => {
                for (key, digest) in entries {
                    println!("{}\t{}", String::from_utf8_lossy(&key), hex::encode(digest));
                }
            }
            Err(e) => eprintln!("error: {e}"),
        },
        Command::Rebuild => match engine.rebuild(tree_id, FullRebuildMode::Always) {
            Ok(count) => println!("rebuilt {count} segment(s)"),
            Err(e) => eprintln!("error: {e}"),
        },
        Command::Dirty => match engine.digest_store().dirty_segments(tree_id) {
            Ok(segments) => println!("{segments:?}"),
            Err(e) => eprintln!("error: {e}"),
        },
    }
}

fn parse_line(line: &str) -> Option<Command> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["put", key, value] => Some(Command::Put { key: (*key).into(), value: (*value).into() }),
        ["rm", key] => Some(Command::Rm { key: (*key).into() }),
        ["get", key] => Some(Command::Get { key: (*key).into() }),
        ["segment", seg_id] => seg_id.parse().ok().map(|seg_id| Command::Segment { seg_id }),
        ["rebuild"] => Some(Command::Rebuild),
        ["dirty"] => Some(Command::Dirty),
        _ => None,
    }
}

fn run_repl(engine: &Engine, tree_id: TreeId) -> rustyline::Result<()> {
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline("hashtree> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "exit" || trimmed == "quit" {
                    break;
                }
                match parse_line(trimmed) {
                    Some(command) => run_command(engine, tree_id, &command),
                    None => eprintln!("unrecognized command: {trimmed}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn main() {
    env_logger_init();
    let cli = Cli::parse();
    let engine = new_engine(cli.tree, cli.segments);

    match cli.command {
        Some(command) => run_command(&engine, cli.tree, &command),
        None => {
            if let Err(e) = run_repl(&engine, cli.tree) {
                eprintln!("repl error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn env_logger_init() {
    let _ = env_logger::try_init();
}
