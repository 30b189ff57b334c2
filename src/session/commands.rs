use std::path::{Path, PathBuf};
use async_trait::async_trait;
use chrono::Local;
use rustc_hash::FxHashMap;
use tokio::fs;
use tracing::{debug, info};

use crate::session::Session;
use crate::status::Status;
use crate::transfer::{resolve_file_name, TransferOutcome};

/// A command handler. It runs exactly once for a command line and must write exactly one
///  end-of-response line. Invalid arguments are reported to the peer as an error status line;
///  an `Err` is reserved for failures that leave the channel unusable, and closes the session.
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()>;
}

/// creates a handler from the command line's arguments (everything after the verb)
pub type CommandFactory = fn(&str) -> Box<dyn Command>;

/// Maps (lower case) verbs to handlers. Verbs are matched case-insensitively.
pub struct CommandRegistry {
    factories: FxHashMap<&'static str, CommandFactory>,
}

impl CommandRegistry {
    pub fn empty() -> CommandRegistry {
        CommandRegistry {
            factories: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, verb: &'static str, factory: CommandFactory) {
        self.factories.insert(verb, factory);
    }

    pub fn create(&self, verb: &str, args: &str) -> Option<Box<dyn Command>> {
        self.factories
            .get(verb.to_lowercase().as_str())
            .map(|factory| factory(args))
    }

    pub fn verbs(&self) -> Vec<&'static str> {
        let mut result = self.factories.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        let mut result = CommandRegistry::empty();
        result.register("echo", |args| Box::new(EchoCommand { text: args.to_string() }));
        result.register("close", |_| Box::new(CloseCommand));
        result.register("time", |_| Box::new(TimeCommand));
        result.register("help", |_| Box::new(HelpCommand));
        result.register("list", |_| Box::new(ListCommand));
        result.register("download", |args| Box::new(DownloadCommand { args: TransferArgs::parse(args) }));
        result.register("upload", |args| Box::new(UploadCommand { args: TransferArgs::parse(args) }));
        result
    }
}


pub struct EchoCommand {
    pub text: String,
}

#[async_trait]
impl Command for EchoCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        session.channel().write_message(Status::Success, &self.text).await?;
        session.channel().write_end_message().await
    }
}

pub struct CloseCommand;

#[async_trait]
impl Command for CloseCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        info!("{:?} requested to close the session", session.channel().peer_addr());
        session.close();
        session.channel().write_end_message().await
    }
}

pub struct TimeCommand;

#[async_trait]
impl Command for TimeCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        let now = Local::now().format("%a %-d %B %Y, %H:%M:%S").to_string();
        session.channel().write_message(Status::Success, &now).await?;
        session.channel().write_end_message().await
    }
}

const HELP_TEXT: &str = "\
HELP:
  CLOSE - close the connection and leave the server
  DOWNLOAD file_name [local_name] [continue] - download a file from the server, optionally resuming an interrupted download
  ECHO text - send the text back
  HELP - show this text
  LIST - list the files available for download
  TIME - show the server's local time
  UPLOAD file_name remote_name [continue] - upload a file to the server, optionally resuming an interrupted upload";

pub struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        for line in HELP_TEXT.lines() {
            session.channel().write_message(Status::Success, line).await?;
        }
        session.channel().write_end_message().await
    }
}

pub struct ListCommand;

impl ListCommand {
    async fn listing(dir: &Path) -> std::io::Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let kind = if entry.file_type().await?.is_dir() { "Directory" } else { "File" };
            entries.push(format!("{}: {}", kind, entry.file_name().to_string_lossy()));
        }
        entries.sort();
        Ok(entries)
    }
}

#[async_trait]
impl Command for ListCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        let dir = session.config().download_dir.clone();
        match Self::listing(&dir).await {
            Ok(entries) if entries.is_empty() => {
                session.channel().write_message(Status::Success, "Directory is empty.").await?;
            }
            Ok(entries) => {
                session.channel().write_message(Status::Success, "Contents of the download directory:").await?;
                for entry in entries {
                    session.channel().write_message(Status::Success, &entry).await?;
                }
            }
            Err(e) => {
                debug!("error listing {:?}: {}", dir, e);
                session.channel().write_message(Status::Error, "Download directory is not accessible.").await?;
            }
        }
        session.channel().write_end_message().await
    }
}


/// Arguments of `download` and `upload`: two file names (the remote and the local one, in the
///  order of the transfer's direction) and an optional resume flag in the third position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferArgs {
    pub source_name: Option<String>,
    pub target_name: Option<String>,
    pub resume: bool,
}

impl TransferArgs {
    pub fn parse(args: &str) -> TransferArgs {
        let mut parts = args.split_whitespace();
        let source_name = parts.next().map(str::to_string);
        let target_name = parts.next().map(str::to_string);
        let resume = parts.next().is_some_and(is_resume_flag);
        TransferArgs { source_name, target_name, resume }
    }
}

pub fn is_resume_flag(arg: &str) -> bool {
    arg.eq_ignore_ascii_case("continue") || arg.eq_ignore_ascii_case("-continue")
}

/// Validates a file name argument and resolves it in a directory, reporting problems to the
///  peer. `None` means the command is done.
async fn resolve_name_arg(session: &mut Session, dir: &Path, name: Option<&str>) -> anyhow::Result<Option<PathBuf>> {
    let Some(name) = name else {
        session.channel().write_message(Status::Error, "No file name given").await?;
        return Ok(None);
    };

    match resolve_file_name(dir, name) {
        Ok(path) => Ok(Some(path)),
        Err(e) => {
            session.channel().write_message(Status::Error, &e.to_string()).await?;
            Ok(None)
        }
    }
}

/// `download name [local_name] [continue]` - the local name only matters to the client
pub struct DownloadCommand {
    pub args: TransferArgs,
}

#[async_trait]
impl Command for DownloadCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        // the end-of-response marker comes first, the binary phase or an error line follows
        session.channel().write_end_message().await?;

        let dir = session.config().download_dir.clone();
        let Some(path) = resolve_name_arg(session, &dir, self.args.source_name.as_deref()).await? else {
            return Ok(());
        };

        let peer = session.channel().peer_addr().ip();
        let engine = session.engine();
        let outcome = engine.lock().await
            .download_file(session.channel(), &path, peer, self.args.resume).await?;

        match outcome {
            TransferOutcome::Completed { bytes } => {
                debug!("sent {} bytes of {:?} to {}", bytes, path, peer);
                Ok(())
            }
            TransferOutcome::FileNotFound => {
                let name = self.args.source_name.as_deref().unwrap_or_default();
                session.channel().write_message(Status::Error, &format!("File {} not found", name)).await
            }
            TransferOutcome::ResumeRejected => {
                session.channel().write_message(Status::Error, "Cannot resume: no matching unfinished download").await
            }
        }
    }
}

/// `upload local_name name [continue]` - the file is stored under the second name
pub struct UploadCommand {
    pub args: TransferArgs,
}

#[async_trait]
impl Command for UploadCommand {
    async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
        session.channel().write_end_message().await?;

        if self.args.source_name.is_none() {
            return session.channel().write_message(Status::Error, "No file name given").await;
        }
        let dir = session.config().upload_dir.clone();
        let Some(path) = resolve_name_arg(session, &dir, self.args.target_name.as_deref()).await? else {
            return Ok(());
        };

        let peer = session.channel().peer_addr().ip();
        let engine = session.engine();
        let outcome = engine.lock().await
            .upload_file(session.channel(), &path, peer, self.args.resume).await?;

        debug!("upload of {:?} from {}: {:?}", path, peer, outcome);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::Mutex;
    use crate::channel::StreamChannel;
    use crate::config::ServerConfig;
    use crate::transfer::TransferEngine;
    use super::*;

    #[rstest]
    #[case::empty("", None, None, false)]
    #[case::name_only("a.txt", Some("a.txt"), None, false)]
    #[case::two_names("a.txt b.txt", Some("a.txt"), Some("b.txt"), false)]
    #[case::resume("a.txt b.txt continue", Some("a.txt"), Some("b.txt"), true)]
    #[case::resume_dash("a.txt b.txt -CONTINUE", Some("a.txt"), Some("b.txt"), true)]
    #[case::flag_in_second_position("a.txt continue", Some("a.txt"), Some("continue"), false)]
    #[case::unknown_flag("a.txt b.txt later", Some("a.txt"), Some("b.txt"), false)]
    fn test_transfer_args(#[case] args: &str, #[case] source: Option<&str>, #[case] target: Option<&str>, #[case] resume: bool) {
        let parsed = TransferArgs::parse(args);
        assert_eq!(parsed.source_name.as_deref(), source);
        assert_eq!(parsed.target_name.as_deref(), target);
        assert_eq!(parsed.resume, resume);
    }

    #[rstest]
    #[case::lower("echo", true)]
    #[case::upper("ECHO", true)]
    #[case::mixed("DownLoad", true)]
    #[case::unknown("ping", false)]
    #[case::empty("", false)]
    fn test_registry_lookup(#[case] verb: &str, #[case] expected: bool) {
        assert_eq!(CommandRegistry::default().create(verb, "").is_some(), expected);
    }

    #[test]
    fn test_registry_verbs() {
        assert_eq!(CommandRegistry::default().verbs(), vec!["close", "download", "echo", "help", "list", "time", "upload"]);
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        download_dir: PathBuf,
        session: Session,
        client: BufReader<DuplexStream>,
    }

    fn fixture() -> Fixture {
        fixture_with_commands(CommandRegistry::default())
    }

    fn fixture_with_commands(commands: CommandRegistry) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("download");
        std::fs::create_dir(&download_dir).unwrap();

        let config = Arc::new(ServerConfig {
            read_timeout: Duration::from_secs(5),
            download_dir: download_dir.clone(),
            upload_dir: dir.path().join("upload"),
            ..Default::default()
        });

        let (a, b) = duplex(4096);
        let (r, w) = split(a);
        let channel = StreamChannel::new(r, w, SocketAddr::from(([127, 0, 0, 1], 4711)), 8192);
        let engine = Arc::new(Mutex::new(TransferEngine::new(&config)));
        Fixture {
            _dir: dir,
            download_dir,
            session: Session::with_commands(Box::new(channel), engine, config, Arc::new(commands)),
            client: BufReader::new(b),
        }
    }

    async fn run(session: &mut Session, client: &mut BufReader<DuplexStream>, line: &str) -> Vec<String> {
        client.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        client.write_all(b"close\n").await.unwrap();
        session.communicate().await;

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        output.lines().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_help_emits_one_line_per_line() {
        let mut f = fixture();
        let output = run(&mut f.session, &mut f.client, "help").await;

        assert_eq!(output.len(), HELP_TEXT.lines().count() + 2);
        assert!(output[..output.len() - 2].iter().all(|line| line.starts_with("200 ")));
        assert_eq!(output[output.len() - 2], "300 END");
    }

    #[tokio::test]
    async fn test_time() {
        let mut f = fixture();
        let output = run(&mut f.session, &mut f.client, "time").await;
        assert!(output[0].starts_with("200 "));
        assert_eq!(output[1], "300 END");
    }

    #[tokio::test]
    async fn test_list() {
        let mut f = fixture();
        std::fs::write(f.download_dir.join("b.txt"), b"b").unwrap();
        std::fs::write(f.download_dir.join("a.txt"), b"a").unwrap();
        std::fs::create_dir(f.download_dir.join("sub")).unwrap();

        let output = run(&mut f.session, &mut f.client, "list").await;
        assert_eq!(output, vec![
            "200 Contents of the download directory:",
            "200 Directory: sub",
            "200 File: a.txt",
            "200 File: b.txt",
            "300 END",
            "300 END",
        ]);
    }

    #[tokio::test]
    async fn test_list_empty() {
        let mut f = fixture();
        let output = run(&mut f.session, &mut f.client, "list").await;
        assert_eq!(output, vec!["200 Directory is empty.", "300 END", "300 END"]);
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let mut f = fixture();
        let output = run(&mut f.session, &mut f.client, "download missing.txt").await;
        assert_eq!(output, vec!["300 END", "400 File missing.txt not found", "300 END"]);
    }

    #[rstest]
    #[case::download_no_name("download", "400 No file name given")]
    #[case::download_escaping("download ../secret.txt", "400 Invalid file name: ../secret.txt")]
    #[case::upload_no_name("upload", "400 No file name given")]
    #[case::upload_one_name("upload a.txt", "400 No file name given")]
    #[case::upload_absolute("upload a.txt /etc/passwd", "400 Invalid file name: /etc/passwd")]
    #[tokio::test]
    async fn test_invalid_transfer_args(#[case] line: &str, #[case] expected_error: &str) {
        let mut f = fixture();
        let output = run(&mut f.session, &mut f.client, line).await;
        assert_eq!(output, vec!["300 END", expected_error, "300 END"]);
    }

    #[tokio::test]
    async fn test_download_resume_rejected() {
        let mut f = fixture();
        std::fs::write(f.download_dir.join("a.txt"), b"abc").unwrap();

        let output = run(&mut f.session, &mut f.client, "download a.txt a.txt continue").await;
        assert_eq!(output, vec!["300 END", "400 Cannot resume: no matching unfinished download", "300 END"]);
    }

    #[tokio::test]
    async fn test_download_over_session() {
        let Fixture { _dir, download_dir, mut session, mut client } = fixture();
        std::fs::write(download_dir.join("a.txt"), b"abc").unwrap();

        let session_task = tokio::spawn(async move {
            session.communicate().await;
        });

        client.write_all(b"download a.txt\n").await.unwrap();
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "300 END\n");
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "200 ACCEPT\n");

        client.write_all(&[1]).await.unwrap();
        assert_eq!(client.read_u64().await.unwrap(), 3);
        let mut content = [0u8; 3];
        client.read_exact(&mut content).await.unwrap();
        assert_eq!(&content, b"abc");

        // the session continues after the transfer
        client.write_all(b"echo still here\nclose\n").await.unwrap();
        let mut rest = String::new();
        client.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "200 still here\n300 END\n300 END\n");

        session_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_registry() {
        struct Shout;
        #[async_trait]
        impl Command for Shout {
            async fn execute(&self, session: &mut Session) -> anyhow::Result<()> {
                session.channel().write_message(Status::Success, "HEY").await?;
                session.channel().write_end_message().await
            }
        }

        let mut registry = CommandRegistry::empty();
        registry.register("shout", |_| Box::new(Shout));
        registry.register("close", |_| Box::new(CloseCommand));

        let mut f = fixture_with_commands(registry);
        let output = run(&mut f.session, &mut f.client, "shout").await;
        assert_eq!(output, vec!["200 HEY", "300 END", "300 END"]);

        let mut registry = CommandRegistry::empty();
        registry.register("close", |_| Box::new(CloseCommand));
        let mut f = fixture_with_commands(registry);
        let output = run(&mut f.session, &mut f.client, "echo hi").await;
        assert_eq!(output, vec!["400 No such command: echo", "300 END", "300 END"]);
    }
}
