pub mod client;

use futures::stream::BoxStream;

/// Lazy, finite sequence of generated text fragments in emission order.
pub type FragmentStream = BoxStream<'static, String>;

/// A source of streamed model output.
///
/// Implementations never surface transport faults as errors: a failure is
/// delivered as a final human-readable fragment and the stream ends.
pub trait Generate: Send + Sync {
    fn stream(&self, prompt: &str, model: &str) -> FragmentStream;
}
