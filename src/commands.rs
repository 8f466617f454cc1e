//! Command dispatcher: maps slash-prefixed user input to session actions.
//!
//! Bare input (no slash) is an implicit `/msg` to the current last
//! recipient. Unknown commands produce an info line, never an error.
//! Every dispatch ends with a prompt refresh.

use anyhow::Result;

use crate::proto;
use crate::session::SessionCtx;

fn split2(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((a, b)) => (a, b),
        None => (s, ""),
    }
}

/// Handle one line of user input. Errors are transport failures only —
/// everything recoverable becomes an info line.
pub async fn dispatch(ctx: &SessionCtx, line: &str) -> Result<()> {
    let result = if let Some(rest) = line.strip_prefix('/') {
        let (cmd, args) = split2(rest);
        match cmd {
            "msg" => cmd_msg(ctx, args).await,
            "join" => cmd_join(ctx, args).await,
            "part" => cmd_part(ctx, args).await,
            "nick" => cmd_nick(ctx, args).await,
            "quit" => cmd_quit(ctx).await,
            "ctcp" => cmd_ctcp(ctx, args).await,
            "quote" => cmd_quote(ctx, args).await,
            "help" => cmd_help(ctx).await,
            unknown => {
                ctx.info(format!("Unknown command \"{unknown}\" - try /help"))
                    .await;
                Ok(())
            }
        }
    } else if !line.is_empty() {
        let rcpt = ctx.last_rcpt();
        cmd_msg(ctx, &format!("{rcpt} {line}")).await
    } else {
        Ok(())
    };
    ctx.refresh_prompt();
    result
}

/// `/msg <rcpt> [text]` — updates the last recipient even when there is
/// no text. Direct (non-channel) targets go through the encryption
/// adapter, one outbound line per fragment, in order.
async fn cmd_msg(ctx: &SessionCtx, args: &str) -> Result<()> {
    let (rcpt, text) = split2(args);
    if rcpt.is_empty() {
        return Ok(());
    }
    ctx.set_last_rcpt(rcpt);
    if text.is_empty() {
        return Ok(());
    }

    if rcpt.starts_with('#') {
        ctx.writer
            .send_line(&proto::format("PRIVMSG", &[rcpt], Some(text)))
            .await?;
        return Ok(());
    }

    let sent = {
        let mut crypto = ctx.crypto.lock().await;
        crypto.send_to_peer(rcpt, text)
    };
    match sent {
        Ok(sent) => {
            for fragment in &sent.fragments {
                ctx.writer
                    .send_line(&proto::format("PRIVMSG", &[rcpt], Some(fragment)))
                    .await?;
            }
        }
        Err(e) => {
            ctx.info(format!("Encryption error with {rcpt}: {e}")).await;
        }
    }
    Ok(())
}

async fn cmd_join(ctx: &SessionCtx, args: &str) -> Result<()> {
    ctx.set_last_rcpt(args);
    ctx.writer
        .send_line(&proto::format("JOIN", &[args], None))
        .await?;
    Ok(())
}

async fn cmd_part(ctx: &SessionCtx, args: &str) -> Result<()> {
    let (channel, reason) = split2(args);
    ctx.writer
        .send_line(&proto::format("PART", &[channel], Some(reason)))
        .await?;
    Ok(())
}

async fn cmd_nick(ctx: &SessionCtx, args: &str) -> Result<()> {
    ctx.writer
        .send_line(&proto::format("NICK", &[args], None))
        .await?;
    Ok(())
}

async fn cmd_quit(ctx: &SessionCtx) -> Result<()> {
    // The server closes the stream in response; the read loop then takes
    // the session down.
    ctx.writer
        .send_line(&proto::format("QUIT", &[], Some("Leaving.")))
        .await?;
    Ok(())
}

async fn cmd_ctcp(ctx: &SessionCtx, args: &str) -> Result<()> {
    let (rcpt, text) = split2(args);
    ctx.writer
        .send_line(&proto::format("PRIVMSG", &[rcpt], Some(text)))
        .await?;
    Ok(())
}

/// `/quote` — raw line passthrough.
async fn cmd_quote(ctx: &SessionCtx, args: &str) -> Result<()> {
    ctx.writer.send_line(args).await?;
    Ok(())
}

async fn cmd_help(ctx: &SessionCtx) -> Result<()> {
    for usage in [
        "/join <channel>[,channel2,...,channeln]",
        "/msg <rcpt> [msg]",
        "/part <channel>",
        "/quit",
    ] {
        ctx.info(usage.to_string()).await;
    }
    Ok(())
}
