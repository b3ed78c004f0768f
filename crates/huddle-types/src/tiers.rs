use serde::{Deserialize, Serialize};

use crate::models::{Tier, UsagePeriod, UsageResource};

/// Ceilings a room gets for its tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_participants: u32,
    pub messages_per_hour: u64,
    pub messages_per_day: u64,
    pub ai_responses_per_hour: u64,
    pub ai_responses_per_day: u64,
    pub reasoning_messages_per_hour: u64,
    pub reasoning_messages_per_day: u64,
    pub threads_per_day: u64,
    pub thread_message_cap: u64,
    pub context_window_tokens: u64,
}

pub const FREE: TierLimits = TierLimits {
    max_participants: 3,
    messages_per_hour: 100,
    messages_per_day: 400,
    ai_responses_per_hour: 20,
    ai_responses_per_day: 80,
    reasoning_messages_per_hour: 15,
    reasoning_messages_per_day: 50,
    threads_per_day: 3,
    thread_message_cap: 30,
    context_window_tokens: 32_000,
};

pub const BASIC: TierLimits = TierLimits {
    max_participants: 8,
    messages_per_hour: 200,
    messages_per_day: 800,
    ai_responses_per_hour: 50,
    ai_responses_per_day: 200,
    reasoning_messages_per_hour: 80,
    reasoning_messages_per_day: 300,
    threads_per_day: 5,
    thread_message_cap: 60,
    context_window_tokens: 128_000,
};

pub const PREMIUM: TierLimits = TierLimits {
    max_participants: 25,
    messages_per_hour: 500,
    messages_per_day: 2000,
    ai_responses_per_hour: 100,
    ai_responses_per_day: 400,
    reasoning_messages_per_hour: 200,
    reasoning_messages_per_day: 800,
    threads_per_day: 10,
    thread_message_cap: 200,
    context_window_tokens: 512_000,
};

pub fn limits_for(tier: Tier) -> &'static TierLimits {
    match tier {
        Tier::Free => &FREE,
        Tier::Basic => &BASIC,
        Tier::Premium => &PREMIUM,
    }
}

impl TierLimits {
    /// Ceiling for a counter, or `None` when the tier does not limit that window.
    pub fn limit(&self, resource: UsageResource, period: UsagePeriod) -> Option<u64> {
        match (resource, period) {
            (UsageResource::Messages, UsagePeriod::Hour) => Some(self.messages_per_hour),
            (UsageResource::Messages, UsagePeriod::Day) => Some(self.messages_per_day),
            (UsageResource::AiResponses, UsagePeriod::Hour) => Some(self.ai_responses_per_hour),
            (UsageResource::AiResponses, UsagePeriod::Day) => Some(self.ai_responses_per_day),
            (UsageResource::ReasoningMessages, UsagePeriod::Hour) => {
                Some(self.reasoning_messages_per_hour)
            }
            (UsageResource::ReasoningMessages, UsagePeriod::Day) => {
                Some(self.reasoning_messages_per_day)
            }
            (UsageResource::Threads, UsagePeriod::Day) => Some(self.threads_per_day),
            _ => None,
        }
    }

    /// Every numeric field, in table order. Used for ordering checks.
    pub fn fields(&self) -> [u64; 10] {
        [
            self.max_participants as u64,
            self.messages_per_hour,
            self.messages_per_day,
            self.ai_responses_per_hour,
            self.ai_responses_per_day,
            self.reasoning_messages_per_hour,
            self.reasoning_messages_per_day,
            self.threads_per_day,
            self.thread_message_cap,
            self.context_window_tokens,
        ]
    }
}
