use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod analysis;
mod cache;
mod cli;
mod codebase;
mod config;
mod engine;
mod extract;
mod fetch;
mod fingerprint;
mod index;
mod llm;
mod record;
mod retry;
#[cfg(test)]
mod tests;
mod web;

use cli::Command;
use config::Config;
use engine::Engine;
use index::Removal;

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let config = Config::load_with(Config::default_base_path())?;
    let engine = Engine::from_config(config)?;

    match args.command {
        Command::Enrich { urls } => {
            let urls: Vec<String> = urls.iter().map(|u| u.trim().to_string()).collect();
            if let [url] = urls.as_slice() {
                print_json(&engine.enrich(url)?)?;
            } else {
                print_json(&engine.enrich_batch(&urls))?;
            }
        }

        Command::Delete { url } => match engine.delete(url.trim())? {
            Removal::NotFound => anyhow::bail!("{} is not in the armory", url.trim()),
            removed => print_json(&removed)?,
        },

        Command::Search { text, k } => {
            print_json(&engine.search(&text, k)?)?;
        }

        Command::Size {} => {
            println!("{}", engine.index_size()?);
        }

        Command::Rebuild {} => {
            let entries = engine.rebuild()?;
            println!("{entries} entries indexed");
        }

        Command::Show { url } => match engine.get(url.trim())? {
            Some(record) => print_json(&record)?,
            None => anyhow::bail!("{} is not in the armory", url.trim()),
        },

        Command::Analyse { file, project } => {
            let summary = match project {
                Some(root) => engine.analyse_in(&root, &file)?,
                None => engine.analyse(&file)?,
            };
            print_json(&summary)?;
        }

        Command::Codebase {
            project,
            query,
            k,
            reindex,
        } => {
            if reindex {
                engine.reindex_codebase(&project)?;
            }
            match query {
                Some(query) => print_json(&engine.search_codebase(&project, &query, k)?)?,
                None if reindex => {}
                None => anyhow::bail!("nothing to do: pass a query or --reindex"),
            }
        }

        Command::Impact { url, goal, structure } => {
            let structure = match structure {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("{} is not valid JSON", path.display()))?
                }
                None => serde_json::Value::Null,
            };
            print_json(&engine.impact(url.trim(), &goal, &structure)?)?;
        }

        Command::Models {} => {
            for model in engine.list_models()? {
                println!("{model}");
            }
        }

        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| engine.config().web.listen.clone());
            let engine = Arc::new(engine);
            web::start_daemon(engine.clone(), &listen)?;

            match Arc::try_unwrap(engine) {
                Ok(engine) => engine.shutdown()?,
                Err(_) => log::warn!("engine still referenced after shutdown"),
            }
            return Ok(());
        }
    }

    engine.shutdown()?;
    Ok(())
}
