//! Re-chunks model text into whole words with a small pause between them so
//! clients render a steady flow instead of provider-sized bursts.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use super::{ModelEvent, ModelEventStream};

struct SmoothState {
    inner: ModelEventStream,
    buffer: String,
    pending: VecDeque<anyhow::Result<ModelEvent>>,
    delay: Duration,
    done: bool,
}

pub fn smooth_words(inner: ModelEventStream, delay: Duration) -> ModelEventStream {
    let state = SmoothState {
        inner,
        buffer: String::new(),
        pending: VecDeque::new(),
        delay,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if matches!(item, Ok(ModelEvent::TextDelta(_))) && !state.delay.is_zero() {
                    tokio::time::sleep(state.delay).await;
                }
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.inner.next().await {
                Some(Ok(ModelEvent::TextDelta(text))) => {
                    state.buffer.push_str(&text);
                    while let Some(word) = take_word(&mut state.buffer) {
                        state.pending.push_back(Ok(ModelEvent::TextDelta(word)));
                    }
                }
                Some(other) => {
                    flush(&mut state);
                    state.pending.push_back(other);
                }
                None => {
                    flush(&mut state);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

fn flush(state: &mut SmoothState) {
    if !state.buffer.is_empty() {
        let rest = std::mem::take(&mut state.buffer);
        state.pending.push_back(Ok(ModelEvent::TextDelta(rest)));
    }
}

/// Split off the leading text up to and including the whitespace that ends
/// the first word. `None` while no word is complete.
fn take_word(buffer: &mut String) -> Option<String> {
    let mut seen_word = false;
    let mut end = None;
    for (idx, ch) in buffer.char_indices() {
        if ch.is_whitespace() {
            if seen_word {
                end = Some(idx + ch.len_utf8());
            }
        } else if end.is_some() {
            break;
        } else {
            seen_word = true;
        }
    }

    // Trailing whitespace may continue in the next delta.
    let end = end.filter(|&end| end < buffer.len())?;
    let rest = buffer.split_off(end);
    Some(std::mem::replace(buffer, rest))
}
