//! The chat turn loop: append the user's turn, drain the model's fragment
//! stream into a growing accumulator, then persist the finished reply.

use anyhow::Result;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::chat::Message;
use crate::events::TurnEvent;
use crate::inference::Generate;
use crate::manager::SessionManager;
use crate::ocr::{self, OcrAdapter};

/// In-progress concatenation of fragments. Only ever grows.
#[derive(Debug, Default)]
pub struct Accumulator {
    text: String,
}

impl Accumulator {
    pub fn push(&mut self, fragment: &str) -> &str {
        self.text.push_str(fragment);
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Model and generator used for every turn of an interaction.
pub struct TurnContext<'a> {
    pub generator: &'a dyn Generate,
    pub model: &'a str,
}

/// Run one turn against the current session.
///
/// `display` sees the user turn, then the accumulator after every non-empty
/// fragment, then the completed reply. The reply lands in the session that
/// was current when the turn started.
pub async fn run_turn<F>(
    manager: &mut SessionManager,
    ctx: &TurnContext<'_>,
    user_turn: Message,
    prompt: &str,
    mut display: F,
) -> Result<Message>
where
    F: FnMut(TurnEvent),
{
    let session_id = manager.current_id().to_string();

    manager.append_message(&session_id, user_turn.clone()).await?;
    display(TurnEvent::UserTurn(user_turn));

    let mut fragments = ctx.generator.stream(prompt, ctx.model);
    let mut acc = Accumulator::default();
    let mut count = 0usize;
    while let Some(fragment) = fragments.next().await {
        count += 1;
        if fragment.is_empty() {
            continue;
        }
        display(TurnEvent::Partial(acc.push(&fragment).to_string()));
    }
    debug!("Turn in {} drained {} fragments", session_id, count);

    let reply = Message::assistant(acc.into_string());
    manager.append_message(&session_id, reply.clone()).await?;
    display(TurnEvent::Completed(reply.clone()));
    Ok(reply)
}

pub async fn text_turn<F>(
    manager: &mut SessionManager,
    ctx: &TurnContext<'_>,
    prompt: &str,
    display: F,
) -> Result<Message>
where
    F: FnMut(TurnEvent),
{
    run_turn(manager, ctx, Message::user(prompt), prompt, display).await
}

/// Prompt sent to the model for an uploaded image.
pub fn image_prompt(extracted: &str) -> String {
    format!(
        "I've uploaded an image. Here's the text extracted from it:\n\n\
         {}\n\n\
         Please analyze this image by:\n\
         1. Explaining what the extracted text means\n\
         2. Describing what type of document or image this appears to be\n\
         3. Providing any insights or summary about the content.",
        extracted
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    /// The model answered; the reply is persisted.
    Answered(Message),
    /// The upload could not be decoded; an error marker was appended.
    Rejected(Message),
    /// Recognition found no text; nothing was appended.
    NoText,
}

impl ImageOutcome {
    /// Whether the processed guard should be set for this upload.
    pub fn consumes_upload(&self) -> bool {
        !matches!(self, ImageOutcome::NoText)
    }
}

/// Run OCR on an uploaded image and, when text comes back, a model turn
/// analysing it.
pub async fn image_turn<F>(
    manager: &mut SessionManager,
    ctx: &TurnContext<'_>,
    ocr: &OcrAdapter,
    upload: &[u8],
    mut display: F,
) -> Result<ImageOutcome>
where
    F: FnMut(TurnEvent),
{
    let image = match ocr::decode_upload(upload) {
        Ok(image) => image,
        Err(e) => {
            warn!("Rejected upload: {:#}", e);
            let marker = Message::assistant(ocr::error_marker(&e));
            let session_id = manager.current_id().to_string();
            manager.append_message(&session_id, marker.clone()).await?;
            display(TurnEvent::Completed(marker.clone()));
            return Ok(ImageOutcome::Rejected(marker));
        }
    };

    let extracted = ocr.extract(&image).await;
    if extracted.is_empty() {
        info!("OCR found no text in upload");
        return Ok(ImageOutcome::NoText);
    }

    let user_turn = Message::user_image(ocr::to_base64_png(&image)?);
    let prompt = image_prompt(&extracted);
    let reply = run_turn(manager, ctx, user_turn, &prompt, display).await?;
    Ok(ImageOutcome::Answered(reply))
}

/// Remembers the last uploaded file name so that re-submitting the same
/// upload does not run OCR and inference again.
#[derive(Debug, Default, Clone)]
pub struct UploadGuard {
    last_name: Option<String>,
    processed: bool,
}

impl UploadGuard {
    /// Record an upload and report whether it still needs processing. A new
    /// file name resets the guard.
    pub fn should_process(&mut self, file_name: &str) -> bool {
        if self.last_name.as_deref() != Some(file_name) {
            self.last_name = Some(file_name.to_string());
            self.processed = false;
        }
        !self.processed
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
    }
}
