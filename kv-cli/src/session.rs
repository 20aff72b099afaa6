use std::io::BufRead;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use colored::Colorize;
use rustyline::config::Builder;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Editor};
use tokio::time::Instant;

use meshkv::config::CacheConfig;
use meshkv::encoding::{codec_for, EncodingFormat};
use meshkv::net::transport::tcp::TcpTransport;
use meshkv::topology::NodeId;
use meshkv::txn::{ConcurrencyMode, IsolationLevel};
use meshkv::version::CacheVersion;

use crate::config::ConfigLoad;
use crate::progress;
use crate::rusty::CliHelper;
use crate::show::Show;

const COMMANDS: &[&str] = &[
    "GET", "PUT", "DEL", "BEGIN", "COMMIT", "ROLLBACK", "STATUS", "TOPOLOGY", "JOIN", "exit", "quit",
];

pub struct Session {
    is_repl: bool,
    settings: ConfigLoad,
    node: Arc<meshkv::cluster::Node<TcpTransport>>,
    open_tx: Option<CacheVersion>,
    keywords: Arc<Vec<String>>,
}

impl Session {
    pub async fn try_new(settings: ConfigLoad, is_repl: bool, _running: Arc<AtomicBool>, join: bool) -> Result<Self> {
        if is_repl {
            println!("Welcome to {}.", settings.prompt.as_deref().unwrap_or(crate::config::DEFAULT_PROMPT));
            println!("Binding node {} on {}.", settings.node_id, settings.listen_addr);
            println!();
        }

        let node = start_node(&settings, join).await?;

        Ok(Self {
            is_repl,
            settings,
            node,
            open_tx: None,
            keywords: Arc::new(COMMANDS.iter().map(|s| s.to_string()).collect()),
        })
    }

    fn prompt(&self) -> String {
        let base = self.settings.prompt.as_deref().unwrap_or(crate::config::DEFAULT_PROMPT);
        if self.open_tx.is_some() {
            format!("{base}(tx) > ")
        } else {
            format!("{base} > ")
        }
    }

    pub async fn handle_repl(&mut self) {
        let rl_config = Builder::new().completion_prompt_limit(5).completion_type(CompletionType::Circular).build();
        let mut rl = Editor::<CliHelper, DefaultHistory>::with_config(rl_config).unwrap();
        rl.set_helper(Some(CliHelper::with_keywords(self.keywords.clone())));
        rl.load_history(&history_path()).ok();

        loop {
            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line.as_str());
                    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                        break;
                    }
                    if let Err(e) = self.handle_line(true, &line).await {
                        eprintln!("{} {e}", "error:".red().bold());
                    }
                }
                Err(ReadlineError::Interrupted) => println!("^C"),
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("io err: {e}");
                    break;
                }
            }
        }

        println!("Bye~");
        let _ = rl.save_history(&history_path());
    }

    pub async fn handle_reader<R: BufRead>(&mut self, r: R) -> Result<()> {
        let start = Instant::now();
        for line in r.lines() {
            let line = line.map_err(|e| anyhow!("read line: {e}"))?;
            let line = line.trim();
            if line.is_empty() || line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                continue;
            }
            self.handle_line(self.is_repl, line).await?;
        }
        if self.settings.is_show_stats() {
            println!("{:.3}", start.elapsed().as_secs_f64());
        }
        Ok(())
    }

    async fn handle_line(&mut self, is_repl: bool, line: &str) -> Result<()> {
        let start = Instant::now();
        let show = Show::new_with_start(self.settings.is_show_stats(), is_repl, start);
        let words: Vec<&str> = line.split_whitespace().collect();
        let cmd = words[0].to_uppercase();

        match cmd.as_str() {
            "GET" => self.cmd_get(&words, is_repl).await?,
            "PUT" => self.cmd_put(&words, is_repl).await?,
            "DEL" => self.cmd_del(&words, is_repl).await?,
            "BEGIN" => self.cmd_begin(&words, is_repl).await?,
            "COMMIT" => self.cmd_commit(is_repl).await?,
            "ROLLBACK" => self.cmd_rollback(is_repl).await?,
            "STATUS" | "TOPOLOGY" => self.cmd_status(is_repl),
            "JOIN" => self.cmd_join(&words, is_repl).await?,
            other => return Err(anyhow!("unknown command: {other}")),
        }

        show.output(1);
        Ok(())
    }

    async fn cmd_get(&self, words: &[&str], _is_repl: bool) -> Result<()> {
        if words.len() < 2 {
            return Err(anyhow!("GET requires a key"));
        }
        let format = parse_format(words.get(2).copied())?;
        match self.node.get(words[1].as_bytes()).await? {
            Some(value) => println!("{}", render(format, &value)),
            None => println!("{}", "N/A ~".yellow()),
        }
        Ok(())
    }

    async fn cmd_put(&self, words: &[&str], _is_repl: bool) -> Result<()> {
        if words.len() < 3 {
            return Err(anyhow!("PUT requires a key and a value"));
        }
        let format = parse_format(words.get(3).copied())?;
        let value = parse(format, words[2])?;
        if let Some(tx) = self.open_tx {
            self.node.tx_put(tx, words[1].as_bytes().to_vec(), value).await?;
        } else {
            self.node.put(words[1].as_bytes().to_vec(), value).await?;
        }
        println!("{}", "OK ~".green());
        Ok(())
    }

    async fn cmd_del(&self, words: &[&str], _is_repl: bool) -> Result<()> {
        if words.len() < 2 {
            return Err(anyhow!("DEL requires a key"));
        }
        if let Some(tx) = self.open_tx {
            self.node.tx_remove(tx, words[1].as_bytes().to_vec()).await?;
        } else {
            self.node.remove(words[1].as_bytes().to_vec()).await?;
        }
        println!("{}", "OK ~".green());
        Ok(())
    }

    async fn cmd_begin(&mut self, words: &[&str], _is_repl: bool) -> Result<()> {
        if self.open_tx.is_some() {
            return Err(anyhow!("a transaction is already open, COMMIT or ROLLBACK it first"));
        }
        let concurrency = match words.get(1).map(|s| s.to_uppercase()).as_deref() {
            Some("OPTIMISTIC") => ConcurrencyMode::Optimistic,
            _ => ConcurrencyMode::Pessimistic,
        };
        let isolation = match words.get(2).map(|s| s.to_uppercase()).as_deref() {
            Some("REPEATABLE-READ") => IsolationLevel::RepeatableRead,
            Some("SERIALIZABLE") => IsolationLevel::Serializable,
            _ => IsolationLevel::ReadCommitted,
        };
        let tx = self.node.begin_transaction(concurrency, isolation).await;
        self.open_tx = Some(tx);
        println!("{}", "BEGIN ~".green());
        Ok(())
    }

    async fn cmd_commit(&mut self, _is_repl: bool) -> Result<()> {
        let tx = self.open_tx.take().ok_or_else(|| anyhow!("no open transaction"))?;
        self.node.commit_transaction(tx).await?;
        println!("{}", "COMMIT ~".green());
        Ok(())
    }

    async fn cmd_rollback(&mut self, _is_repl: bool) -> Result<()> {
        let tx = self.open_tx.take().ok_or_else(|| anyhow!("no open transaction"))?;
        self.node.rollback_transaction(tx).await?;
        println!("{}", "ROLLBACK ~".green());
        Ok(())
    }

    fn cmd_status(&self, _is_repl: bool) {
        println!("{}", self.node.status());
    }

    async fn cmd_join(&self, words: &[&str], _is_repl: bool) -> Result<()> {
        let top_ver: u32 = words.get(1).ok_or_else(|| anyhow!("JOIN requires a new topology version"))?.parse()?;
        let members = words[2..]
            .iter()
            .map(|s| s.parse::<NodeId>().map_err(|e| anyhow!("invalid member id {s}: {e}")))
            .collect::<Result<Vec<NodeId>>>()?;
        if members.is_empty() {
            return Err(anyhow!("JOIN requires at least one member id"));
        }
        let bar = progress::spinner("rebalancing");
        let result = self.node.rebalance(top_ver, members).await;
        progress::finish(bar, if result.is_ok() { "rebalance complete" } else { "rebalance failed" });
        result?;
        println!("{}", "OK ~".green());
        Ok(())
    }
}

async fn start_node(settings: &ConfigLoad, join: bool) -> Result<Arc<meshkv::cluster::Node<TcpTransport>>> {
    let listen_addr = settings.listen_addr.parse()?;
    let peers = settings
        .peers
        .iter()
        .map(|(id, addr)| Ok::<_, anyhow::Error>((*id, addr.parse()?)))
        .collect::<Result<std::collections::HashMap<_, _>>>()?;

    let transport = TcpTransport::bind(settings.node_id, listen_addr, peers).await?;
    let cache: CacheConfig = settings.cache.clone();
    let warm_from_disk = cache.persist_path.is_some();

    let node = if join {
        meshkv::cluster::Node::join(settings.node_id, cache, transport)?
    } else {
        meshkv::cluster::Node::new(settings.node_id, cache, transport)?
    };

    if warm_from_disk {
        let bar = progress::spinner("warming from disk");
        let loaded = node.warm().await?;
        progress::finish(bar, format!("warmed {loaded} entries"));
    }

    Ok(node)
}

fn parse_format(word: Option<&str>) -> Result<Option<EncodingFormat>> {
    match word {
        None => Ok(None),
        Some(s) => Ok(Some(s.parse().map_err(|e: meshkv::encoding::EncodingError| anyhow!(e.to_string()))?)),
    }
}

fn render(format: Option<EncodingFormat>, value: &[u8]) -> String {
    match format {
        None => String::from_utf8_lossy(value).into_owned(),
        Some(fmt) => codec_for(fmt).encode(value).expect("byte-to-text codecs never fail to encode"),
    }
}

fn parse(format: Option<EncodingFormat>, input: &str) -> Result<Vec<u8>> {
    match format {
        None => Ok(input.as_bytes().to_vec()),
        Some(fmt) => Ok(codec_for(fmt).decode(input)?),
    }
}

fn history_path() -> String {
    format!("{}/.meshkv_history", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}
