//! Line-oriented operator console.
//!
//! Every line is one command. A bad line prints a diagnostic and the console
//! carries on; only `quit`, `exit`, end of input or shutdown (Ctrl-C) leave
//! the loop.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines},
    sync::mpsc,
};

use crate::cli::{parse_line, split_uids, ConsoleCommand};
use crate::context::AppContext;
use crate::export::{render, ExportFormat};
use crate::live::LiveEvent;
use crate::session::DeviceSession;
use crate::transport::ParamValue;

const LIVE_SINK_CAPACITY: usize = 256;

enum Flow {
    Continue,
    Quit,
}

pub struct Console<'a, R, W> {
    ctx: &'a AppContext,
    lines: Lines<R>,
    out: W,
}

impl<'a, R, W> Console<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(ctx: &'a AppContext, input: R, out: W) -> Self {
        Self {
            ctx,
            lines: input.lines(),
            out,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Read and execute commands until `quit`, end of input, or shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let shutdown = self.ctx.shutdown.clone();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = self.lines.next_line() => line.context("failed to read input")?,
            };
            let Some(line) = line else {
                break;
            };
            let command = match parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(err) => {
                    self.say(err.to_string().trim_end()).await?;
                    continue;
                }
            };

            if let Flow::Quit = self.execute(command).await? {
                break;
            }
        }
        Ok(())
    }

    async fn execute(&mut self, command: ConsoleCommand) -> Result<Flow> {
        match command {
            ConsoleCommand::Devices => self.devices().await?,
            ConsoleCommand::Rename { uid, name } => {
                let name = name.join(" ");
                match self.ctx.registry.rename(&uid, &name).await {
                    Ok(()) => self.say(format!("{uid} is now '{name}'")).await?,
                    Err(err) => self.say(format!("error: {err}")).await?,
                }
            }
            ConsoleCommand::Get { uid, param } => self.get(&uid, &param).await?,
            ConsoleCommand::Set { uid, param, value } => self.set(&uid, &param, &value).await?,
            ConsoleCommand::Live {
                store,
                uids,
                interval_ms,
            } => self.live(&split_uids(&uids), interval_ms, store).await?,
            ConsoleCommand::Export { format, out, uids } => {
                self.export(&uids, format, out.as_deref()).await?
            }
            ConsoleCommand::Logs { lines } => self.logs(lines).await?,
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn devices(&mut self) -> Result<()> {
        let views = match self.ctx.registry.list().await {
            Ok(views) => views,
            Err(err) => return self.say(format!("error: {err}")).await,
        };
        if views.is_empty() {
            return self.say("no watches known yet").await;
        }
        for view in views {
            let state = if view.is_connected() {
                "connected"
            } else {
                "disconnected"
            };
            self.say(format!(
                "{}\t{}\t{state}\t{} readings",
                view.uid, view.name, view.reading_count
            ))
            .await?;
        }
        Ok(())
    }

    async fn logs(&mut self, count: usize) -> Result<()> {
        let lines = self.ctx.logs.recent(count);
        if lines.is_empty() {
            return self.say("no log lines yet").await;
        }
        for line in lines {
            self.say(line).await?;
        }
        Ok(())
    }

    async fn get(&mut self, uid: &str, param: &str) -> Result<()> {
        let Some(session) = self.connected_session(uid).await? else {
            return Ok(());
        };
        match session.request(param).await {
            Ok(values) => {
                let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
                self.say(format!("{param} = [{}]", rendered.join(", "))).await
            }
            Err(err) => self.say(format!("error: {err}")).await,
        }
    }

    async fn set(&mut self, uid: &str, param: &str, raw: &str) -> Result<()> {
        let Some(session) = self.connected_session(uid).await? else {
            return Ok(());
        };
        let value = ParamValue::parse_loose(raw);
        match session.set_value(param, value.clone()).await {
            Ok(()) => self.say(format!("{param} set to {value}")).await,
            Err(err) => self.say(format!("error: {err}")).await,
        }
    }

    async fn live(&mut self, uids: &[String], interval_ms: i64, store: bool) -> Result<()> {
        let (sink, mut events) = mpsc::channel(LIVE_SINK_CAPACITY);
        let mut capture = self.ctx.new_capture();

        let report = match capture.start(uids, interval_ms, store, sink).await {
            Ok(report) => report,
            Err(err) => return self.say(format!("error: {err}")).await,
        };
        for (uid, err) in &report.failed {
            self.say(format!("could not start live on {uid}: {err}")).await?;
        }
        self.say(format!(
            "live on {} watch(es); press enter to stop",
            report.active.len()
        ))
        .await?;

        let shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.print_event(&event).await?,
                    None => break,
                },
                line = self.lines.next_line() => {
                    // The stopping line is consumed; a read error or EOF stops too.
                    let _ = line;
                    break;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        let summary = capture.stop().await;
        while let Ok(event) = events.try_recv() {
            self.print_event(&event).await?;
        }
        self.say(format!(
            "live stopped: {} readings, {} stored, {} not stored",
            summary.delivered, summary.stored, summary.store_failures
        ))
        .await
    }

    async fn print_event(&mut self, event: &LiveEvent) -> Result<()> {
        self.say(format!("({}) {}", event.watch_uid, event.reading))
            .await
    }

    async fn export(
        &mut self,
        uids: &[String],
        format: ExportFormat,
        target: Option<&Path>,
    ) -> Result<()> {
        let snapshots = match self.ctx.registry.snapshots(uids).await {
            Ok(snapshots) => snapshots,
            Err(err) => return self.say(format!("error: {err}")).await,
        };

        let mut buffer = Vec::new();
        render(&snapshots, format, &mut buffer).context("failed to render export")?;

        match target {
            Some(path) => {
                if let Err(err) = tokio::fs::write(path, &buffer).await {
                    return self
                        .say(format!("error: cannot write {}: {err}", path.display()))
                        .await;
                }
                let rows: usize = snapshots.iter().map(|watch| watch.readings.len()).sum();
                self.say(format!(
                    "exported {rows} readings from {} watch(es) to {}",
                    snapshots.len(),
                    path.display()
                ))
                .await
            }
            None => {
                self.out
                    .write_all(&buffer)
                    .await
                    .context("failed to write export")?;
                self.out.flush().await.context("failed to write export")
            }
        }
    }

    async fn connected_session(
        &mut self,
        uid: &str,
    ) -> Result<Option<DeviceSession>> {
        let session = self
            .ctx
            .registry
            .find_by_uid(uid)
            .await
            .and_then(|view| view.session)
            .filter(|session| !session.is_closed());
        if session.is_none() {
            self.say(format!("error: watch with id {uid} not connected"))
                .await?;
        }
        Ok(session)
    }

    async fn say(&mut self, text: impl AsRef<str>) -> Result<()> {
        self.out
            .write_all(text.as_ref().as_bytes())
            .await
            .context("failed to write to console")?;
        self.out
            .write_all(b"\n")
            .await
            .context("failed to write to console")?;
        self.out.flush().await.context("failed to write to console")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;
    use crate::config::AppConfig;
    use crate::session::DEFAULT_SUBSCRIBER_BUFFER;
    use crate::transport::{duplex, fake::FakeWatch};

    async fn context(dir: &tempfile::TempDir) -> AppContext {
        let config = AppConfig {
            database_path: dir.path().join("database.db"),
            ..AppConfig::default()
        };
        AppContext::open(config).await.unwrap()
    }

    async fn connect(ctx: &AppContext, uid: &str) -> (DeviceSession, FakeWatch) {
        let (link, endpoint) = duplex(format!("fake-{uid}"));
        let session = DeviceSession::spawn(link, DEFAULT_SUBSCRIBER_BUFFER);
        let watch = FakeWatch::spawn(endpoint, Some(uid), false);
        ctx.registry.attach(uid, session.clone()).await.unwrap();
        (session, watch)
    }

    async fn run_script(ctx: &AppContext, script: &str) -> String {
        let mut console = Console::new(ctx, BufReader::new(script.as_bytes()), Vec::new());
        console.run().await.unwrap();
        String::from_utf8(console.into_output()).unwrap()
    }

    #[tokio::test]
    async fn devices_rename_get_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let (_session, _watch) = connect(&ctx, "abc123").await;
        ctx.registry
            .record_reading(
                "abc123",
                crate::db::Reading::from_millis("hr", 0, vec![60.0]).unwrap(),
            )
            .await
            .unwrap();

        let output = run_script(
            &ctx,
            "devices\nrename abc123 left wrist\nget abc123 system.uid\nexport --format csv\nquit\ndevices\n",
        )
        .await;
        let lines: Vec<_> = output.lines().collect();

        assert_eq!(
            lines,
            [
                "abc123\tWatch 0\tconnected\t1 readings",
                "abc123 is now 'left wrist'",
                "system.uid = [\"abc123\"]",
                "Watch UID,Sensor,Date,Data...",
                "abc123,hr,1970-01-01T00:00:00.000Z,60.0",
            ]
        );
        assert_eq!(
            ctx.database().load_all_watches().await.unwrap()[0].name,
            "left wrist"
        );
    }

    #[tokio::test]
    async fn bad_lines_do_not_end_the_console() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;

        let output = run_script(
            &ctx,
            "frobnicate\nlive ghost 100\nexport --format tsv ghost\nget ghost x\ndevices\n",
        )
        .await;

        assert!(output.contains("error: watch with id ghost not known"));
        assert!(output.contains("error: unknown watch 'ghost'"));
        assert!(output.contains("error: watch with id ghost not connected"));
        assert!(output.trim_end().ends_with("no watches known yet"));
    }

    #[tokio::test]
    async fn logs_prints_the_newest_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await.with_logs(crate::LogBuffer::new(4));

        assert_eq!(run_script(&ctx, "logs\n").await, "no log lines yet\n");

        for n in 0..6 {
            ctx.logs.push(format!("line {n}"));
        }
        assert_eq!(run_script(&ctx, "logs -n 3\n").await, "line 3\nline 4\nline 5\n");
        assert_eq!(run_script(&ctx, "logs\n").await, "line 2\nline 3\nline 4\nline 5\n");
    }

    #[tokio::test]
    async fn export_writes_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let (_session, _watch) = connect(&ctx, "abc123").await;
        let target = dir.path().join("out.tsv");

        let output = run_script(
            &ctx,
            &format!("export --format tsv --out {}\n", target.display()),
        )
        .await;

        assert!(output.starts_with("exported 0 readings from 1 watch(es)"));
        let written = std::fs::read_to_string(&target).unwrap();
        assert_eq!(written, "Watch UID\tSensor\tDate\tData...\n");
    }

    #[tokio::test]
    async fn live_runs_until_the_next_line() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let (_session, watch) = connect(&ctx, "abc123").await;
        let (mut keyboard, input) = tokio::io::duplex(1024);

        let ctx_ref = &ctx;
        let console_task = async move {
            let mut console = Console::new(ctx_ref, BufReader::new(input), Vec::new());
            console.run().await.unwrap();
            String::from_utf8(console.into_output()).unwrap()
        };
        let operator = async move {
            keyboard.write_all(b"live --store abc123 100\n").await.unwrap();
            while subscriber_count(ctx_ref, "abc123").await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            watch.push("hr", 1_000, vec![72.0]).await;
            while ctx_ref.registry.find_by_uid("abc123").await.unwrap().reading_count == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            keyboard.write_all(b"\ndevices\n").await.unwrap();
            drop(keyboard);
        };

        let (output, ()) = tokio::join!(console_task, operator);
        assert!(output.contains("live on 1 watch(es)"));
        assert!(output.contains("(abc123) hr @ 1970-01-01T00:00:01.000Z [72.0]"));
        assert!(output.contains("live stopped: 1 readings, 1 stored, 0 not stored"));
        assert!(output.trim_end().ends_with("abc123\tWatch 0\tconnected\t1 readings"));
    }

    #[tokio::test]
    async fn shutdown_stops_live_and_the_console() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let (session, _watch) = connect(&ctx, "abc123").await;
        let (mut keyboard, input) = tokio::io::duplex(1024);

        let ctx_ref = &ctx;
        let console_task = async move {
            let mut console = Console::new(ctx_ref, BufReader::new(input), Vec::new());
            console.run().await.unwrap();
            String::from_utf8(console.into_output()).unwrap()
        };
        let operator = async move {
            keyboard.write_all(b"live abc123 100\n").await.unwrap();
            while subscriber_count(ctx_ref, "abc123").await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ctx_ref.shutdown.cancel();
            // Input stays open; only the shutdown can end the console.
            keyboard
        };

        let (output, _keyboard) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(console_task, operator) },
        )
        .await
        .unwrap();
        assert!(output.contains("live stopped: 0 readings, 0 stored, 0 not stored"));
        assert_eq!(session.subscriber_count(), 0);
    }

    async fn subscriber_count(ctx: &AppContext, uid: &str) -> usize {
        ctx.registry
            .find_by_uid(uid)
            .await
            .and_then(|view| view.session)
            .map_or(0, |session| session.subscriber_count())
    }
}
