use anyhow::Result;
use minijinja::Environment;
use serde::Serialize;

use crate::chat::{ChatSession, Message, Role, Theme};
use crate::ocr;

const PAGE_TEMPLATE: &str = "page.html";

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub current: bool,
}

impl SessionSummary {
    pub fn new(session: &ChatSession, current_id: &str) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            current: session.id == current_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub role: Role,
    pub content: Option<String>,
    /// `data:` URI for image turns whose payload decodes.
    pub image_src: Option<String>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        let image_src = message
            .image
            .as_deref()
            .filter(|payload| ocr::from_base64_png(payload).is_ok())
            .map(|payload| format!("data:image/png;base64,{}", payload));
        Self {
            role: message.role,
            content: message.content.clone(),
            image_src,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageView {
    pub title: String,
    pub theme: Theme,
    pub ocr_mode: bool,
    pub query: String,
    pub sessions: Vec<SessionSummary>,
    pub messages: Vec<MessageView>,
}

pub struct PageRenderer {
    env: Environment<'static>,
}

impl PageRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(PAGE_TEMPLATE, include_str!("templates/page.html"))?;
        Ok(Self { env })
    }

    pub fn render(&self, view: &PageView) -> Result<String> {
        let template = self.env.get_template(PAGE_TEMPLATE)?;
        Ok(template.render(view)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(messages: Vec<Message>) -> PageView {
        PageView {
            title: "<b>Title</b>".into(),
            theme: Theme::Dark,
            ocr_mode: true,
            query: String::new(),
            sessions: vec![SessionSummary {
                id: "abc".into(),
                title: "First chat".into(),
                current: true,
            }],
            messages: messages.iter().map(MessageView::from).collect(),
        }
    }

    #[test]
    fn message_text_is_escaped() {
        let renderer = PageRenderer::new().unwrap();
        let html = renderer
            .render(&view(vec![Message::user("<script>alert(1)</script>")]))
            .unwrap();

        assert!(!html.contains("<script>alert(1)</script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&lt;b&gt;Title"));
        assert!(html.contains("theme-dark"));
        assert!(html.contains("First chat"));
    }

    #[test]
    fn undecodable_images_are_not_embedded() {
        let good = MessageView::from(&Message::user_image("aGVsbG8="));
        assert_eq!(good.image_src.as_deref(), Some("data:image/png;base64,aGVsbG8="));

        let bad = MessageView::from(&Message::user_image("not base64!"));
        assert!(bad.image_src.is_none());
    }
}
