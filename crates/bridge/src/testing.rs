use std::sync::Mutex;

use {
    async_trait::async_trait,
    deskbridge_channels::{BotOutbound, ChannelType, DepartmentChoice, Result},
};

/// Outbound transport that records what would have been sent.
#[derive(Default)]
pub struct RecordingOutbound {
    pub sent: Mutex<Vec<(String, String)>>,
    pub menus: Mutex<Vec<(String, Vec<DepartmentChoice>)>>,
    pub fail_next: Mutex<usize>,
}

impl RecordingOutbound {
    pub fn texts(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn menu_count(&self) -> usize {
        self.menus.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl BotOutbound for RecordingOutbound {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<()> {
        {
            let mut fail = self.fail_next.lock().unwrap_or_else(|e| e.into_inner());
            if *fail > 0 {
                *fail -= 1;
                return Err(deskbridge_channels::Error::unavailable("telegram is down"));
            }
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((conversation_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_department_menu(
        &self,
        conversation_id: &str,
        _text: &str,
        choices: &[DepartmentChoice],
    ) -> Result<()> {
        self.menus
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((conversation_id.to_string(), choices.to_vec()));
        Ok(())
    }
}
