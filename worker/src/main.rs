use std::io::{self, Write};

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use tokio::signal;

use worker::{Cli, RunConfig, bootstrap};

fn init_logging(cli: &Cli) {
    let prefix = if cli.local {
        "local".to_string()
    } else {
        format!("rank-{}", cli.rank)
    };

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            let ts = buf.timestamp_millis();
            write!(
                buf,
                "[{prefix}] {ts} {} {}: {}",
                record.level(),
                record.target(),
                record.args()
            )?;

            let mut kvs = KvWriter(Vec::new());
            record
                .key_values()
                .visit(&mut kvs)
                .map_err(|e| io::Error::other(e.to_string()))?;
            if !kvs.0.is_empty() {
                write!(buf, " {}", kvs.0.join(" "))?;
            }

            writeln!(buf)
        })
        .init();
}

struct KvWriter(Vec<String>);

impl<'kvs> log::kv::VisitSource<'kvs> for KvWriter {
    fn visit_pair(
        &mut self,
        key: log::kv::Key<'kvs>,
        value: log::kv::Value<'kvs>,
    ) -> Result<(), log::kv::Error> {
        self.0.push(format!("{key}={value}"));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let cfg = RunConfig::try_from(cli).inspect_err(|e| error!("{e}"))?;
    info!(
        rank = cfg.rank, world_size = cfg.world_size.get(), epochs = cfg.epochs;
        "running {} strategies", cfg.strategies.len()
    );

    tokio::select! {
        ret = bootstrap::run(&cfg) => {
            let summaries = ret.inspect_err(|e| error!("{e}"))?;
            for s in summaries {
                info!(
                    "finish {} rank {}, train+val {:.3}s, train {:.3}s, reduce_count {}",
                    s.strategy, s.rank, s.total_secs, s.train_secs, s.reduce_count
                );
            }
        }
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
        }
    }

    Ok(())
}
