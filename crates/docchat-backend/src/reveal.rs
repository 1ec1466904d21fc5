//! Word-by-word reveal of a finished answer.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{Stream, StreamExt};

/// Cumulative content after each space-separated word.
///
/// Every prefix ends with a trailing space, including the last one.
pub fn word_prefixes(text: &str) -> Vec<String> {
    let mut current = String::with_capacity(text.len() + 1);
    text.split(' ')
        .map(|word| {
            current.push_str(word);
            current.push(' ');
            current.clone()
        })
        .collect()
}

/// Emit `word_prefixes(text)` one per `delay`, the first after one `delay`.
///
/// A zero `delay` emits every prefix at once.
pub fn reveal_words(text: &str, delay: Duration) -> impl Stream<Item = String> + Send + 'static {
    let prefixes = word_prefixes(text);
    let stream: Pin<Box<dyn Stream<Item = String> + Send>> = if delay.is_zero() {
        Box::pin(tokio_stream::iter(prefixes))
    } else {
        let count = prefixes.len();
        let mut prefixes = prefixes.into_iter();

        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Box::pin(
            IntervalStream::new(ticker)
                .take(count)
                .map(move |_| prefixes.next().unwrap_or_default()),
        )
    };
    stream
}
