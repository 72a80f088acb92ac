//! Interactive chat against a workspace.
//!
//! Every turn is a fresh two-message exchange built from repository state,
//! so the conversation itself carries no history beyond `memory.md`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use crossterm::ExecutableCommand;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config as EditorConfig, Editor};
use serde_json::json;
use tracing::warn;

use sx_agents::{Mode, PromptBuilder, PromptLimits};
use sx_core::ChatClient;
use sx_tools::{apply_in_workspace, extract, ApplyOutcome, Extraction, Vcs, Workspace};

use crate::commands::{build_client, open_workspace};
use crate::config::Config;

#[derive(Debug, PartialEq, Eq)]
enum ChatCommand {
    Quit,
    Help,
    Mode(String),
    Apply,
    Message(String),
    None,
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return ChatCommand::None;
    }

    if !trimmed.starts_with('/') {
        return ChatCommand::Message(trimmed.to_string());
    }

    let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
    let cmd = parts[0].to_lowercase();
    let arg = parts.get(1).map(|s| s.trim().to_string()).unwrap_or_default();

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/help" | "/?" => ChatCommand::Help,
        "/mode" | "/m" => ChatCommand::Mode(arg),
        "/apply" | "/a" => ChatCommand::Apply,
        _ => {
            eprintln!("Unknown command: {}. Type /help for available commands.", cmd);
            ChatCommand::None
        }
    }
}

fn print_help() {
    println!(
        r#"
Chat Commands:
  /help, /?       Show this help message
  /mode [name]    Show or switch mode (ask, architect, code, debug, orchestrate)
  /apply, /a      Apply the patch from the last reply (staged, not committed)
  /quit, /exit    Exit chat mode

Tips:
  - Reference files with @path or @path:10-40
  - Lines starting with "Decision:" or "Summary:" in replies are remembered
  - Press Ctrl+D to exit
"#
    );
}

/// Per-REPL state: the current mode and the last reply, for `/apply`.
pub struct ChatSession<'a> {
    client: &'a ChatClient,
    workspace: &'a Workspace,
    vcs: &'a dyn Vcs,
    limits: PromptLimits,
    mode: Mode,
    last_reply: Option<String>,
    turns: usize,
}

impl<'a> ChatSession<'a> {
    pub fn new(client: &'a ChatClient, workspace: &'a Workspace, vcs: &'a dyn Vcs, mode: Mode) -> Self {
        Self {
            client,
            workspace,
            vcs,
            limits: PromptLimits::default(),
            mode,
            last_reply: None,
            turns: 0,
        }
    }

    pub fn with_limits(mut self, limits: PromptLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Show the current mode for an empty argument, otherwise switch.
    pub fn switch_mode(&mut self, arg: &str) -> String {
        if arg.is_empty() {
            let names: Vec<&str> = Mode::all().iter().map(|m| m.name()).collect();
            return format!("Current mode: {} (available: {})", self.mode, names.join(", "));
        }
        match arg.parse::<Mode>() {
            Ok(mode) => {
                self.mode = mode;
                format!("Mode set to {}: {}", mode, mode.persona().description())
            }
            Err(e) => e.to_string(),
        }
    }

    pub fn ask(&mut self, text: &str) -> Result<String, sx_core::Error> {
        let prompt = PromptBuilder::new(self.workspace, self.vcs)
            .with_limits(self.limits)
            .build(self.mode, text, None, None)?;
        let reply = self.client.complete(&prompt.system, &prompt.user)?;
        self.turns += 1;

        if let Err(e) = self.workspace.remember(&reply) {
            warn!(error = %e, "Failed to update memory");
        }
        self.workspace.append_history(
            "chat",
            json!({ "mode": self.mode, "request": text, "reply": &reply }),
        );
        if let Err(e) = self.workspace.append_journal(
            &format!("chat ({})", self.mode),
            &format!("> {}\n\n{}", text, reply.trim()),
        ) {
            warn!(error = %e, "Failed to write journal");
        }

        self.last_reply = Some(reply.clone());
        Ok(reply)
    }

    pub fn last_reply_has_patch(&self) -> bool {
        self.last_reply
            .as_deref()
            .is_some_and(|r| matches!(extract(r), Extraction::Patch(_)))
    }

    /// Apply the patch in the last reply. Only a path escape is an error.
    pub fn apply_last(&mut self) -> Result<String, sx_core::Error> {
        let Some(reply) = self.last_reply.as_deref() else {
            return Ok("No reply to apply yet.".to_string());
        };
        let patch = match extract(reply) {
            Extraction::Patch(patch) => patch,
            Extraction::NoOp => return Ok("The last reply says no change is needed.".to_string()),
            Extraction::Unparseable(reason) => {
                return Ok(format!("No patch in the last reply: {}", reason))
            }
        };

        self.vcs.ensure_git()?;
        self.vcs.exclude(self.workspace.meta_name())?;
        let label = format!("chat-{}", self.turns);
        let message = match apply_in_workspace(self.workspace, self.vcs, &patch, &label, false)? {
            ApplyOutcome::Applied { strategy, .. } => {
                format!("Applied with {}. Changes are staged, not committed.", strategy)
            }
            ApplyOutcome::Rejected { reason, .. } => sx_core::Error::patch_rejected(reason).to_string(),
        };
        if let Err(e) = self.workspace.append_journal("chat apply", &message) {
            warn!(error = %e, "Failed to write journal");
        }
        self.workspace.append_history(
            "chat_apply",
            json!({ "mode": self.mode, "files": patch.touched_files(), "result": &message }),
        );
        Ok(message)
    }
}

fn print_colored(color: bool, fg: Color, label: &str, body: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    if color {
        stdout.execute(SetForegroundColor(fg))?;
        write!(stdout, "{}", label)?;
        stdout.execute(ResetColor)?;
    } else {
        write!(stdout, "{}", label)?;
    }
    writeln!(stdout, "{}\n", body)?;
    stdout.flush()
}

/// Run interactive chat mode
pub fn run_chat(config: &Config, project: &Path, mode: Mode) -> Result<()> {
    let workspace = open_workspace(config, project)?;
    let git = workspace.git();
    git.ensure_git()?;
    git.exclude(workspace.meta_name())?;
    let client = build_client(config);
    let mut session =
        ChatSession::new(&client, &workspace, &git, mode).with_limits(config.prompt.limits());
    let color = atty::is(atty::Stream::Stdout);

    // Set up readline with history
    let editor_config = EditorConfig::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();

    let history_path = get_history_path();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(editor_config)?;

    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    println!(
        "Chat on {} in {} mode. Type /help for commands, /quit to exit.\n",
        workspace.root().display(),
        session.mode()
    );

    loop {
        let prompt = format!("{}> ", session.mode());

        match rl.readline(&prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);

                match parse_command(&line) {
                    ChatCommand::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                    ChatCommand::Help => print_help(),
                    ChatCommand::Mode(arg) => println!("{}\n", session.switch_mode(&arg)),
                    ChatCommand::Apply => match session.apply_last() {
                        Ok(message) => println!("{}\n", message),
                        Err(e) => eprintln!("Error: {}\n", e),
                    },
                    ChatCommand::Message(text) => match session.ask(&text) {
                        Ok(reply) => {
                            print_colored(color, Color::Cyan, "assistant> ", reply.trim())?;
                            if session.last_reply_has_patch() {
                                println!("(patch detected, /apply to apply it)\n");
                            }
                        }
                        Err(e) => eprintln!("\nError: {}\n", e),
                    },
                    ChatCommand::None => {}
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = rl.save_history(path);
    }

    Ok(())
}

fn get_history_path() -> Option<PathBuf> {
    Config::config_dir().ok().map(|d| d.join("chat_history"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sx_core::testing::MockProvider;
    use sx_tools::{GitCli, DEFAULT_META_DIR};

    const PATCH_REPLY: &str = "Decision: keep the script tiny\n\n```diff\ndiff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-print(\"old\")\n+print(\"new\")\n```\n";

    fn project() -> (tempfile::TempDir, Workspace, GitCli) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), DEFAULT_META_DIR).unwrap();
        let git = ws.git();
        git.ensure_git().unwrap();
        git.exclude(DEFAULT_META_DIR).unwrap();
        std::fs::write(dir.path().join("app.py"), "print(\"old\")\n").unwrap();
        git.stage_all().unwrap();
        git.commit("initial").unwrap();
        (dir, ws, git)
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  /quit "), ChatCommand::Quit);
        assert_eq!(parse_command("/mode debug"), ChatCommand::Mode("debug".into()));
        assert_eq!(parse_command("/mode"), ChatCommand::Mode(String::new()));
        assert_eq!(parse_command("/APPLY"), ChatCommand::Apply);
        assert_eq!(parse_command(""), ChatCommand::None);
        assert_eq!(
            parse_command("what does @app.py do?"),
            ChatCommand::Message("what does @app.py do?".into())
        );
    }

    #[test]
    fn test_switch_mode() {
        let (_dir, ws, git) = project();
        let client = ChatClient::new(Box::new(MockProvider::always("NOOP")));
        let mut session = ChatSession::new(&client, &ws, &git, Mode::Ask);

        assert!(session.switch_mode("").contains("Current mode: ask"));
        session.switch_mode("code");
        assert_eq!(session.mode(), Mode::Code);
        assert!(session.switch_mode("refactor").contains("unknown mode"));
        assert_eq!(session.mode(), Mode::Code);
    }

    #[test]
    fn test_ask_then_apply() {
        let (dir, ws, git) = project();
        let client = ChatClient::new(Box::new(MockProvider::always(PATCH_REPLY)));
        let mut session = ChatSession::new(&client, &ws, &git, Mode::Code);

        assert_eq!(session.apply_last().unwrap(), "No reply to apply yet.");

        session.ask("make it print new").unwrap();
        assert!(session.last_reply_has_patch());
        assert!(ws.memory().contains("Decision: keep the script tiny"));

        let message = session.apply_last().unwrap();
        assert!(message.starts_with("Applied with"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"new\")\n"
        );
        // Staged, not committed.
        assert_eq!(git.commit_count().unwrap(), 1);

        // Same patch again no longer applies.
        assert!(session.apply_last().unwrap().starts_with("Patch rejected"));
    }

    #[test]
    fn test_apply_noop_reply() {
        let (_dir, ws, git) = project();
        let client = ChatClient::new(Box::new(MockProvider::always("noop")));
        let mut session = ChatSession::new(&client, &ws, &git, Mode::Ask);
        session.ask("anything to change?").unwrap();
        assert!(!session.last_reply_has_patch());
        assert!(session.apply_last().unwrap().contains("no change is needed"));
    }
}
