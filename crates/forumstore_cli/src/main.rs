//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `forumstore_core` linkage.
//! - Optionally open a store file and print committed row counts per collection.
//! - Keep output deterministic for quick local sanity checks.

use forumstore_core::{Store, StoreConfig};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("forumstore_core ping={}", forumstore_core::ping());
    println!("forumstore_core version={}", forumstore_core::core_version());

    let Some(db_path) = std::env::args_os().nth(1) else {
        return ExitCode::SUCCESS;
    };

    let counts = Store::open(&StoreConfig::file(&db_path)).and_then(|store| store.collection_counts());
    match counts {
        Ok(counts) => {
            println!("store path={}", db_path.to_string_lossy());
            if counts.is_empty() {
                println!("store collections=0");
            }
            for (storage_name, count) in counts {
                println!("collection name={storage_name} count={count}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to open store `{}`: {err}", db_path.to_string_lossy());
            ExitCode::FAILURE
        }
    }
}
