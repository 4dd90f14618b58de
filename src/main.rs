//! Delve 无头驱动
//!
//! 用法：`delve <target-dir> [config.toml]`。从 stdin 逐行读取用户输入，每行一个回合，回复写到 stdout。
//! `/new` 开始新线程，`/quit` 退出。
//! 回合进行中按 Ctrl-C 在当前步骤结束后取消该回合，再按一次立即退出进程（退出码 130）；
//! 空闲等待输入时按 Ctrl-C 直接退出。

use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use delve::core::{create_orchestrator, ThreadId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    delve::observability::init();

    let mut args = std::env::args().skip(1);
    let target = args
        .next()
        .map(PathBuf::from)
        .context("usage: delve <target-dir> [config.toml]")?;
    let target = if target.is_absolute() {
        target
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(target)
    };
    let config_path = args.next().map(PathBuf::from);

    let orchestrator = create_orchestrator(config_path).context("Failed to create orchestrator")?;

    // 进程级只注册一次信号处理，之后每次 Ctrl-C 都转发到 sig_rx
    let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if sig_tx.send(()).is_err() {
                break;
            }
        }
    });

    let mut thread: Option<ThreadId> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            Some(()) = sig_rx.recv() => break,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" => break,
            "/new" => {
                thread = None;
                eprintln!("(new thread)");
                continue;
            }
            _ => {}
        }

        let token = CancellationToken::new();
        let turn = orchestrator.start_turn_with_cancel(thread.clone(), input, &target, token.clone());
        let Some(result) = drive_turn(turn, &token, &mut sig_rx).await else {
            eprintln!("(interrupted)");
            std::process::exit(130);
        };

        match result {
            Ok(reply) => {
                if thread.as_ref() != Some(&reply.thread_id) {
                    eprintln!("(thread {})", reply.thread_id);
                }
                thread = Some(reply.thread_id.clone());
                println!("{}\n", reply.text());
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    Ok(())
}

/// 驱动一个回合直到完成：第一次中断取消 token 并继续等待回合收尾，第二次中断返回 None
async fn drive_turn<F: Future>(
    turn: F,
    token: &CancellationToken,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Option<F::Output> {
    tokio::pin!(turn);
    loop {
        tokio::select! {
            r = &mut turn => return Some(r),
            Some(()) = interrupts.recv() => {
                if token.is_cancelled() {
                    return None;
                }
                eprintln!("(cancelling after the current step, press Ctrl-C again to exit)");
                token.cancel();
            }
        }
    }
}
