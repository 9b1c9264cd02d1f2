use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::future::Future;
use teloxide::payloads::setters::*;
use teloxide::prelude::*;
use teloxide::types::{InputFile, InputMedia, InputMediaPhoto, MessageId, ParseMode};
use tracing::{instrument, warn};

use crate::config::Config;

/// Telegram caption limit for media messages.
pub const CAPTION_LIMIT: usize = 1024;
/// Telegram accepts at most ten items per media group.
const MEDIA_GROUP_LIMIT: usize = 10;

/// One rendered message ready for delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Telegram HTML.
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Photo { url: String },
}

/// Downstream delivery of rendered messages.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one logical message into `thread_id` (forum topic) or the
    /// chat root. Attachments stay grouped with the text.
    async fn send(&self, message: &OutboundMessage, thread_id: Option<i32>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TelegramSink {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramSink {
    pub fn new(bot: Bot, chat_id: i64) -> Self {
        Self {
            bot,
            chat_id: ChatId(chat_id),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(Bot::new(cfg.telegram.bot_token.clone()), cfg.telegram.chat_id)
    }

    async fn send_text(
        &self,
        text: &str,
        thread_id: Option<i32>,
        reply_to: Option<MessageId>,
    ) -> Result<Message> {
        let mut request = self
            .bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true);
        if let Some(thread_id) = thread_id {
            request = request.message_thread_id(thread_id);
        }
        if let Some(reply_to) = reply_to {
            request = request.reply_to_message_id(reply_to);
        }
        request.await.context("telegram sendMessage failed")
    }

    async fn send_album(
        &self,
        photos: &[Url],
        caption: Option<&str>,
        thread_id: Option<i32>,
        reply_to: Option<MessageId>,
    ) -> Result<(), AlbumFailure> {
        deliver_chunks(photos, |chunk_no, chunk| {
            let media = build_media_group(&chunk, if chunk_no == 0 { caption } else { None });
            let mut request = self.bot.send_media_group(self.chat_id, media);
            if let Some(thread_id) = thread_id {
                request = request.message_thread_id(thread_id);
            }
            if let Some(reply_to) = reply_to {
                request = request.reply_to_message_id(reply_to);
            }
            async move {
                request.await.context("telegram sendMediaGroup failed")?;
                Ok(())
            }
        })
        .await
    }
}

/// An album that stopped part way. The caption rides on the first chunk, so
/// once that chunk is out the text has been delivered.
#[derive(Debug)]
pub struct AlbumFailure {
    pub delivered_chunks: usize,
    pub error: anyhow::Error,
}

impl AlbumFailure {
    pub fn caption_delivered(&self) -> bool {
        self.delivered_chunks > 0
    }
}

/// Send `photos` in media-group sized chunks, stopping at the first failure.
async fn deliver_chunks<F, Fut>(photos: &[Url], mut send_chunk: F) -> Result<(), AlbumFailure>
where
    F: FnMut(usize, Vec<Url>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for (chunk_no, chunk) in photos.chunks(MEDIA_GROUP_LIMIT).enumerate() {
        if let Err(error) = send_chunk(chunk_no, chunk.to_vec()).await {
            return Err(AlbumFailure {
                delivered_chunks: chunk_no,
                error,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Sink for TelegramSink {
    #[instrument(skip_all, fields(thread_id = ?thread_id))]
    async fn send(&self, message: &OutboundMessage, thread_id: Option<i32>) -> Result<()> {
        let photos = photo_urls(&message.attachments);
        if photos.is_empty() {
            self.send_text(&message.text, thread_id, None).await?;
            return Ok(());
        }

        if fits_caption(&message.text) {
            match self
                .send_album(&photos, Some(&message.text), thread_id, None)
                .await
            {
                Ok(()) => return Ok(()),
                Err(failure) if failure.caption_delivered() => {
                    warn!(
                        error = ?failure.error,
                        delivered_chunks = failure.delivered_chunks,
                        photos = photos.len(),
                        "later photo chunk failed; caption already delivered"
                    );
                    return Ok(());
                }
                Err(failure) => {
                    warn!(error = ?failure.error, photos = photos.len(), "media group failed; sending text only");
                    self.send_text(&message.text, thread_id, None).await?;
                    return Ok(());
                }
            }
        }

        // Text too long for a caption: text first, then the album as a reply.
        let head = self.send_text(&message.text, thread_id, None).await?;
        if let Err(failure) = self
            .send_album(&photos, None, thread_id, Some(head.id))
            .await
        {
            warn!(
                error = ?failure.error,
                delivered_chunks = failure.delivered_chunks,
                photos = photos.len(),
                "attachments failed; text already delivered"
            );
        }
        Ok(())
    }
}

pub fn fits_caption(text: &str) -> bool {
    text.chars().count() <= CAPTION_LIMIT
}

fn photo_urls(attachments: &[Attachment]) -> Vec<Url> {
    attachments
        .iter()
        .filter_map(|attachment| match attachment {
            Attachment::Photo { url } => match Url::parse(url) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(%url, %err, "skipping attachment with invalid URL");
                    None
                }
            },
        })
        .collect()
}

fn build_media_group(photos: &[Url], caption: Option<&str>) -> Vec<InputMedia> {
    photos
        .iter()
        .enumerate()
        .map(|(i, url)| {
            let mut photo = InputMediaPhoto::new(InputFile::url(url.clone()));
            if i == 0 {
                if let Some(caption) = caption {
                    photo = photo.caption(caption).parse_mode(ParseMode::Html);
                }
            }
            InputMedia::Photo(photo)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_limit_counts_chars_not_bytes() {
        assert!(fits_caption(&"字".repeat(CAPTION_LIMIT)));
        assert!(!fits_caption(&"a".repeat(CAPTION_LIMIT + 1)));
    }

    #[test]
    fn invalid_attachment_urls_are_dropped() {
        let urls = photo_urls(&[
            Attachment::Photo {
                url: "https://images.zsxq.com/a.jpg".into(),
            },
            Attachment::Photo {
                url: "not a url".into(),
            },
        ]);
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].host_str(), Some("images.zsxq.com"));
    }

    fn urls(n: usize) -> Vec<Url> {
        (0..n)
            .map(|i| Url::parse(&format!("https://img/{i}.jpg")).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn album_is_split_into_media_group_chunks() {
        let mut sizes = Vec::new();
        deliver_chunks(&urls(23), |_, chunk| {
            sizes.push(chunk.len());
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[tokio::test]
    async fn failure_after_first_chunk_keeps_caption_delivered() {
        let mut attempted = Vec::new();
        let failure = deliver_chunks(&urls(12), |chunk_no, _| {
            attempted.push(chunk_no);
            async move {
                if chunk_no == 1 {
                    anyhow::bail!("second chunk rejected");
                }
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert_eq!(attempted, vec![0, 1]);
        assert_eq!(failure.delivered_chunks, 1);
        assert!(failure.caption_delivered());
    }

    #[tokio::test]
    async fn failure_on_first_chunk_needs_text_fallback() {
        let failure = deliver_chunks(&urls(12), |_, _| async { Err(anyhow::anyhow!("rejected")) })
            .await
            .unwrap_err();
        assert_eq!(failure.delivered_chunks, 0);
        assert!(!failure.caption_delivered());
    }

    #[test]
    fn caption_goes_on_first_photo_only() {
        let urls = vec![
            Url::parse("https://img/1.jpg").unwrap(),
            Url::parse("https://img/2.jpg").unwrap(),
        ];
        let media = build_media_group(&urls, Some("<b>hi</b>"));
        assert_eq!(media.len(), 2);
        match (&media[0], &media[1]) {
            (InputMedia::Photo(first), InputMedia::Photo(second)) => {
                assert_eq!(first.caption.as_deref(), Some("<b>hi</b>"));
                assert_eq!(first.parse_mode, Some(ParseMode::Html));
                assert!(second.caption.is_none());
            }
            _ => panic!("expected photos"),
        }
    }
}
