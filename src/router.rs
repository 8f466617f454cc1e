//! Message router: maps an inbound verb to its handler and renders the
//! result.
//!
//! Direct chat runs through the encryption adapter's receive path;
//! channel chat never does. Join/part/quit/nick notices honor the
//! session-wide chatter toggle. Everything unrecognized falls through to
//! the generic notice display.

use anyhow::Result;
use colored::{Color, Colorize};

use crate::proto::{self, ParsedMessage};
use crate::session::SessionCtx;

/// Route one inbound message. Errors are transport or terminal write
/// failures; they take the session down.
pub async fn route(ctx: &SessionCtx, msg: ParsedMessage) -> Result<()> {
    match msg.cmd.as_str() {
        "PING" => {
            ctx.writer
                .send_line(&proto::format("PONG", &[], Some(&msg.content)))
                .await?;
            Ok(())
        }
        "PRIVMSG" => privmsg(ctx, msg).await,
        "NICK" => nick_notice(ctx, &msg),
        "JOIN" => join_notice(ctx, &msg),
        "PART" => part_notice(ctx, &msg),
        "QUIT" => quit_notice(ctx, &msg),
        "ERROR" => generic(ctx, &msg, Color::Magenta),
        "INFO" => generic(ctx, &msg, Color::White),
        // NOTICE and everything unrecognized.
        _ => generic(ctx, &msg, Color::Yellow),
    }
}

async fn privmsg(ctx: &SessionCtx, mut msg: ParsedMessage) -> Result<()> {
    if !msg.rcpt.starts_with('#') {
        // Direct message: always through the adapter.
        let received = {
            let mut crypto = ctx.crypto.lock().await;
            crypto.receive_from_peer(&msg.nick, &msg.content)
        };
        let received = match received {
            Ok(r) => r,
            Err(e) => {
                ctx.info(format!("Encryption error with {}: {e}", msg.nick))
                    .await;
                return Ok(());
            }
        };
        // Engine-required responses go out before any display.
        for reply in &received.replies {
            ctx.writer
                .send_line(&proto::format("PRIVMSG", &[&msg.nick], Some(reply)))
                .await?;
        }
        if received.plaintext.is_empty() {
            return Ok(());
        }
        msg.content = received.plaintext;
        msg.decrypted = received.encrypted;
    }

    let line = format!("{}{}{}", stamp(&msg), from_to(&msg), msg.content);
    ctx.sink.write_line(&line)?;
    Ok(())
}

fn nick_notice(ctx: &SessionCtx, msg: &ParsedMessage) -> Result<()> {
    if !ctx.show_chatter {
        return Ok(());
    }
    let line = format!(
        "{}{} is now known as {}",
        stamp(msg),
        msg.nick.as_str().color(Color::Yellow),
        msg.content.as_str().color(Color::Yellow),
    );
    ctx.sink.write_line(&line)?;
    Ok(())
}

fn join_notice(ctx: &SessionCtx, msg: &ParsedMessage) -> Result<()> {
    if !ctx.show_chatter {
        return Ok(());
    }
    let line = format!(
        "{}{}has joined {}",
        stamp(msg),
        nuh(msg),
        msg.content.as_str().color(Color::White),
    );
    ctx.sink.write_line(&line)?;
    Ok(())
}

fn part_notice(ctx: &SessionCtx, msg: &ParsedMessage) -> Result<()> {
    if !ctx.show_chatter {
        return Ok(());
    }
    let mut line = format!(
        "{}{}has left {}",
        stamp(msg),
        nuh(msg),
        msg.rcpt.as_str().color(Color::White),
    );
    if !msg.content.is_empty() {
        line.push_str(&format!(" [{}]", msg.content.as_str().color(Color::White)));
    }
    ctx.sink.write_line(&line)?;
    Ok(())
}

fn quit_notice(ctx: &SessionCtx, msg: &ParsedMessage) -> Result<()> {
    if !ctx.show_chatter {
        return Ok(());
    }
    let mut line = format!("{}{}has quit", stamp(msg), nuh(msg));
    if !msg.content.is_empty() {
        line.push_str(&format!(" [{}]", msg.content.as_str().color(Color::White)));
    }
    ctx.sink.write_line(&line)?;
    Ok(())
}

/// Generic notice/error/info display, with middle arguments in brackets.
fn generic(ctx: &SessionCtx, msg: &ParsedMessage, color: Color) -> Result<()> {
    let mut line = format!(
        "{}{}{} ",
        stamp(msg),
        from_to(msg),
        msg.cmd.as_str().color(color),
    );
    if !msg.args.is_empty() {
        line.push_str(&format!("[{}] ", msg.args.as_str().color(color)));
    }
    line.push_str(&format!("{}", msg.content.as_str().color(color)));
    ctx.sink.write_line(&line)?;
    Ok(())
}

fn stamp(msg: &ParsedMessage) -> String {
    format!("[{}] ", msg.timestamp)
}

/// `[nick@rcpt]` colored by status: green when decrypted, yellow for
/// channels, red for plain direct traffic.
fn from_to(msg: &ParsedMessage) -> String {
    let color = if msg.decrypted {
        Color::Green
    } else if msg.rcpt.starts_with('#') {
        Color::Yellow
    } else {
        Color::Red
    };
    format!(
        "[{}@{}] ",
        msg.nick.as_str().color(color),
        msg.rcpt.as_str().color(color),
    )
}

/// `[nick!user@host]` for join/part/quit notices.
fn nuh(msg: &ParsedMessage) -> String {
    format!("[{}!{}@{}] ", msg.nick, msg.user, msg.host)
}
