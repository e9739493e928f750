//! Context window management applied to the history before each model call.
//!
//! Both transformations work in place and are idempotent: re-annotating
//! moves the breakpoints to the newest turns, re-pruning is a no-op once the
//! excess drops below one chunk.

use tilt_core::message::{CacheControl, ContentBlock, Message, ToolResultContent};

/// User turns that carry a cache breakpoint. The fourth breakpoint the API
/// allows is kept for the system prompt.
pub const CACHE_BREAKPOINTS: usize = 3;

/// Mark the last block of the three most recent block-content user turns
/// as ephemeral cache breakpoints and clear every other marker in the
/// history, including ones nested inside tool results.
///
/// Plain-text user turns cannot carry a marker and are skipped.
pub fn annotate_cache_breakpoints(messages: &mut [Message]) {
    let mut remaining = CACHE_BREAKPOINTS;
    for message in messages.iter_mut().rev() {
        let is_user = message.is_user();
        let Some(blocks) = message.blocks_mut() else {
            continue;
        };
        blocks.iter_mut().for_each(clear_cache_control);
        if !is_user || remaining == 0 {
            continue;
        }
        if let Some(last) = blocks.last_mut() {
            remaining -= 1;
            last.set_cache_control(Some(CacheControl::ephemeral()));
        }
    }
}

fn clear_cache_control(block: &mut ContentBlock) {
    if let ContentBlock::ToolResult {
        content: ToolResultContent::Blocks(inner),
        ..
    } = block
    {
        inner.iter_mut().for_each(clear_cache_control);
    }
    if block.cache_control().is_some() {
        block.set_cache_control(None);
    }
}

fn tool_result_images(messages: &[Message]) -> usize {
    messages
        .iter()
        .flat_map(|m| m.blocks())
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                content: ToolResultContent::Blocks(inner),
                ..
            } => Some(inner.iter().filter(|b| b.is_image()).count()),
            _ => None,
        })
        .sum()
}

/// Drop the oldest screenshots returned in tool results so that `keep`
/// remain, removing only whole multiples of `chunk` so the cached prefix is
/// not invalidated on every call. Returns the number of images removed.
///
/// Ten images with `keep = 3, chunk = 4` removes four: the excess of seven
/// rounds down to one chunk.
pub fn prune_images(messages: &mut [Message], keep: usize, chunk: usize) -> usize {
    let total = tool_result_images(messages);
    let mut excess = total.saturating_sub(keep);
    if chunk > 1 {
        excess -= excess % chunk;
    }
    if excess == 0 {
        return 0;
    }

    let mut to_remove = excess;
    for message in messages.iter_mut() {
        let Some(blocks) = message.blocks_mut() else {
            continue;
        };
        for block in blocks.iter_mut() {
            let ContentBlock::ToolResult {
                content: ToolResultContent::Blocks(inner),
                ..
            } = block
            else {
                continue;
            };
            inner.retain(|b| {
                if to_remove > 0 && b.is_image() {
                    to_remove -= 1;
                    false
                } else {
                    true
                }
            });
        }
        if to_remove == 0 {
            break;
        }
    }
    excess
}
