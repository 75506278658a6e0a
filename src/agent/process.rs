//! Subprocess-backed agent.
//!
//! Spawns a configured command per run, writes the prompt to stdin, and
//! bridges stdout lines to the chunk callback. The child is killed when the
//! run's cancellation token fires or the handle is dropped.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Agent, AgentBlock, AgentError, AgentReply, ChunkSink, RunContext};

/// Configuration for a subprocess agent.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn build_command(&self, ctx: &RunContext) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &ctx.folder_context {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    async fn run(
        &self,
        prompt: &str,
        ctx: RunContext,
        on_chunk: ChunkSink<'_>,
    ) -> Result<AgentReply, AgentError> {
        let mut child = self.build_command(&ctx).spawn()?;

        debug!(command = %self.command, "spawned agent process");

        // Hand the prompt over and close stdin so the agent knows input ended.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Invocation("stdout was not piped".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut collected: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill cancelled agent process");
                    }
                    return Err(AgentError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        on_chunk(AgentBlock::Text { text: line.clone() });
                        collected.push(line);
                    }
                    None => break,
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(AgentError::Invocation(format!(
                "agent process exited with {status}"
            )));
        }

        Ok(AgentReply {
            final_text: collected.join("\n"),
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> RunContext {
        RunContext::new(None, CancellationToken::new())
    }

    #[tokio::test]
    async fn echoes_stdin_lines_as_chunks() {
        let agent = ProcessAgent::new("cat", vec![]);
        let chunks: Mutex<Vec<AgentBlock>> = Mutex::new(Vec::new());

        let reply = agent
            .run("hello process", ctx(), &|block| {
                chunks.lock().unwrap().push(block);
            })
            .await
            .unwrap();

        assert_eq!(reply.final_text, "hello process");
        assert_eq!(chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_invocation_error() {
        let agent = ProcessAgent::new("false", vec![]);
        let err = agent.run("ignored", ctx(), &|_| {}).await.unwrap_err();
        assert!(matches!(err, AgentError::Invocation(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        // `cat` with stdin held open would block forever without the token.
        let agent = ProcessAgent::new("sleep", vec!["30".to_string()]);
        let cancel = CancellationToken::new();
        let run_ctx = RunContext::new(None, cancel.clone());

        let run = agent.run("", run_ctx, &|_| {});
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("run should not complete before cancel"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }

        cancel.cancel();
        let err = run.await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
