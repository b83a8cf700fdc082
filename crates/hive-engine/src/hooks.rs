//! Listener registry for generation lifecycle events.
//!
//! Listeners are wired at startup and receive immutable event records; the
//! only mutator a post-image listener gets is the [`Refusal`] handle.

use crate::api::GenerateRequest;
use crate::driver::ImagePayload;
use crate::error::GenError;

/// Event passed to pre-generate listeners, before any worker is claimed.
pub struct PreGenerateEvent<'a> {
    pub request: &'a GenerateRequest,
    pub batch_id: &'a str,
}

/// Event passed to post-generate listeners, once per produced image.
pub struct PostImageEvent<'a> {
    pub request: &'a GenerateRequest,
    pub batch_id: &'a str,
    pub image: &'a ImagePayload,
    /// Index of this image within the request.
    pub index: u32,
}

/// The single mutator exposed to post-image listeners.
#[derive(Debug, Default)]
pub struct Refusal {
    reason: Option<String>,
    reject_request: bool,
}

impl Refusal {
    /// Discard this image and move on. The last reason given wins.
    pub fn refuse(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    /// Hard refusal: fail the whole request with a caller-visible message
    /// instead of just discarding this image.
    pub fn reject_request(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
        self.reject_request = true;
    }
}

type PreListener = Box<dyn Fn(&PreGenerateEvent<'_>) -> Result<(), String> + Send + Sync>;
type PostListener = Box<dyn Fn(&PostImageEvent<'_>, &mut Refusal) + Send + Sync>;

/// Registry of generation listeners, held by the dispatcher.
#[derive(Default)]
pub struct HookRegistry {
    pre: Vec<PreListener>,
    post: Vec<PostListener>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-generate listener. An `Err` aborts the request with a
    /// user-visible message before any worker is claimed.
    pub fn on_pre_generate(
        &mut self,
        listener: impl Fn(&PreGenerateEvent<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.pre.push(Box::new(listener));
    }

    /// Register a post-image listener.
    pub fn on_post_image(
        &mut self,
        listener: impl Fn(&PostImageEvent<'_>, &mut Refusal) + Send + Sync + 'static,
    ) {
        self.post.push(Box::new(listener));
    }

    pub(crate) fn run_pre(&self, event: &PreGenerateEvent<'_>) -> Result<(), GenError> {
        for listener in &self.pre {
            listener(event).map_err(GenError::User)?;
        }
        Ok(())
    }

    /// Returns the refusal reason when any listener discarded the image.
    /// A hard refusal fails the whole request instead.
    pub(crate) fn run_post(
        &self,
        event: &PostImageEvent<'_>,
    ) -> Result<Option<String>, GenError> {
        let mut refusal = Refusal::default();
        for listener in &self.post {
            listener(event, &mut refusal);
        }
        if refusal.reject_request {
            return Err(GenError::UserData(
                refusal
                    .reason
                    .unwrap_or_else(|| "Image rejected".to_string()),
            ));
        }
        Ok(refusal.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::{HookRegistry, PostImageEvent, PreGenerateEvent};
    use crate::api::GenerateRequest;
    use crate::driver::ImagePayload;
    use crate::error::GenError;

    fn request() -> GenerateRequest {
        GenerateRequest {
            user_id: "tester".to_string(),
            ..GenerateRequest::default()
        }
    }

    #[test]
    fn pre_listener_error_becomes_user_error() {
        let mut hooks = HookRegistry::new();
        hooks.on_pre_generate(|event| {
            if event.request.user_id == "tester" {
                Err("tester is not allowed".to_string())
            } else {
                Ok(())
            }
        });

        let request = request();
        let event = PreGenerateEvent {
            request: &request,
            batch_id: "b1",
        };
        match hooks.run_pre(&event) {
            Err(GenError::User(msg)) => assert_eq!(msg, "tester is not allowed"),
            other => panic!("expected user error, got {other:?}"),
        }
    }

    #[test]
    fn post_listener_can_refuse_an_image() {
        let mut hooks = HookRegistry::new();
        hooks.on_post_image(|event, refusal| {
            if event.index == 1 {
                refusal.refuse("second image rejected");
            }
        });

        let request = request();
        let image = ImagePayload {
            data: vec![0],
            mime: "image/png".to_string(),
        };
        let accepted = PostImageEvent {
            request: &request,
            batch_id: "b1",
            image: &image,
            index: 0,
        };
        let refused = PostImageEvent {
            request: &request,
            batch_id: "b1",
            image: &image,
            index: 1,
        };
        assert!(hooks.run_post(&accepted).unwrap().is_none());
        assert_eq!(
            hooks.run_post(&refused).unwrap().as_deref(),
            Some("second image rejected")
        );
    }

    #[test]
    fn post_listener_can_reject_the_whole_request() {
        let mut hooks = HookRegistry::new();
        hooks.on_post_image(|_, refusal| {
            refusal.reject_request("request violates policy");
        });

        let request = request();
        let image = ImagePayload {
            data: vec![0],
            mime: "image/png".to_string(),
        };
        let event = PostImageEvent {
            request: &request,
            batch_id: "b1",
            image: &image,
            index: 0,
        };
        match hooks.run_post(&event) {
            Err(GenError::UserData(msg)) => assert_eq!(msg, "request violates policy"),
            other => panic!("expected a hard refusal, got {other:?}"),
        }
    }
}
