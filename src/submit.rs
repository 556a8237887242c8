//! Prompt entry and gated submission

use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::browser::{PageDriver, Selector};
use crate::config::TimeoutConfig;
use crate::error::{AskError, AskResult};
use crate::wait::WaitPolicy;

const PROMPT_INPUT: &str = "#prompt-textarea";
const FILE_INPUT: &str = r#"input[type="file"]"#;
const SUBMIT_BUTTON: &str = "#composer-submit-button";

/// Appended to prompts in JSON mode. The response reader waits for the
/// `"finished": "finished"` key this asks for, so the wording is load-bearing.
pub const JSON_PROMPT_SUFFIX: &str = concat!(
    "\n",
    "                    JSON GENERATION STRICT RULES:\n",
    "\n",
    "                        Your goal is to generate one things:\n",
    "\n",
    "                         You will generate ONE JSON and ONLY ONE valid JSON object.\n",
    "\n",
    "                        JSON must be strictly valid (Python json.loads() must parse it without error).\n",
    "\n",
    "                        No explanation, no comments, no extra text — just the JSON block.\n",
    "\n",
    "                        At the end add the key-value:   \"finished\": \"finished\"\"\n",
    "\n",
    "                        Wrap the JSON inside a single ```json code block.\n",
    "\n",
    "                        Once JSON is generated: STOP. No repetition. No extra output.\n",
    "\n",
    "                    JSON GENERATION ADDITIONAL RULES:\n",
    "\n",
    "                        All keys must use double quotes.\n",
    "\n",
    "                        No trailing commas.\n",
    "\n",
    "                        YOU MUST After generating the JSON: STOP IMMEDIATELY. Do not produce any additional JSON, examples, or text.\n",
    "\n",
    "                    \n",
    "\n",
    "                        --- END OF INSTRUCTION ---\n",
    "                    ",
);

/// Prompt text as sent, with the JSON instructions appended when requested
pub fn augment_prompt(prompt: &str, expect_json: bool) -> Cow<'_, str> {
    if expect_json {
        Cow::Owned(format!("{prompt}{JSON_PROMPT_SUFFIX}"))
    } else {
        Cow::Borrowed(prompt)
    }
}

#[derive(Debug, Clone)]
pub struct PromptSubmitter {
    input_timeout: Duration,
    action_timeout: Duration,
    visible_timeout: Duration,
    poll_interval: Duration,
    max_attempts: u32,
    after_submit: WaitPolicy,
}

impl PromptSubmitter {
    pub fn new(timeouts: &TimeoutConfig) -> Self {
        Self {
            input_timeout: timeouts.prompt_input(),
            action_timeout: timeouts.action(),
            visible_timeout: timeouts.submit_visible(),
            poll_interval: timeouts.submit_poll_interval(),
            max_attempts: timeouts.submit_max_attempts,
            after_submit: WaitPolicy::fixed("submission", timeouts.submit_settle()),
        }
    }

    pub async fn submit(
        &self,
        page: &dyn PageDriver,
        prompt: &str,
        file: Option<&Path>,
        expect_json: bool,
    ) -> AskResult<()> {
        let input = Selector::css(PROMPT_INPUT);
        page.wait_for_selector(&input, self.input_timeout).await?;
        debug!("Prompt input available, filling prompt");
        page.fill(&input, &augment_prompt(prompt, expect_json), self.action_timeout)
            .await?;

        if let Some(file) = file {
            info!("Uploading file: {}", file.display());
            page.set_input_files(&Selector::css(FILE_INPUT), file, self.action_timeout)
                .await?;
        }

        let submit = Selector::css(SUBMIT_BUTTON);
        page.wait_for_visible(&submit, self.visible_timeout).await?;
        self.wait_until_enabled(page, &submit).await?;

        debug!("Submitting prompt");
        page.click(&submit, self.action_timeout).await?;
        self.after_submit.settle(page).await;
        Ok(())
    }

    /// Check the enabled state up to `max_attempts` times, `poll_interval` apart
    async fn wait_until_enabled(&self, page: &dyn PageDriver, submit: &Selector) -> AskResult<()> {
        for attempt in 1..=self.max_attempts {
            if page.is_enabled(submit).await? {
                debug!("Submit button is enabled (attempt {})", attempt);
                return Ok(());
            }
            debug!("Submit button still disabled (attempt {})", attempt);
            if attempt < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        error!(
            "Submit button did not become enabled after {} checks",
            self.max_attempts
        );
        Err(AskError::SubmitTimeout {
            attempts: self.max_attempts,
        })
    }
}
