//! The host's own state. Lives on the main thread and is never shared.

use std::collections::BTreeMap;

use prepl_bridge::{HostError, HostState, HostValue};

/// Keys the world owns; REPL clients may read but not write them.
const FRAME_KEY: &str = "frame";
const TITLE_KEY: &str = "title";

pub struct World {
    title: String,
    frame: u64,
    values: BTreeMap<String, HostValue>,
}

impl World {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            frame: 0,
            values: BTreeMap::new(),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn advance_frame(&mut self) {
        self.frame += 1;
    }

    fn check_writable(key: &str) -> Result<(), HostError> {
        match key {
            "" => Err(HostError::InvalidKey(key.to_string())),
            FRAME_KEY | TITLE_KEY => Err(HostError::ReadOnly(key.to_string())),
            _ => Ok(()),
        }
    }
}

impl HostState for World {
    fn get(&self, key: &str) -> Option<HostValue> {
        match key {
            FRAME_KEY => Some(HostValue::Integer(self.frame as i64)),
            TITLE_KEY => Some(HostValue::String(self.title.clone())),
            _ => self.values.get(key).cloned(),
        }
    }

    fn set(&mut self, key: &str, value: HostValue) -> Result<(), HostError> {
        Self::check_writable(key)?;
        if value.is_nil() {
            self.values.remove(key);
        } else {
            log::debug!("frame {}: {} = {}", self.frame, key, value);
            self.values.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<Option<HostValue>, HostError> {
        Self::check_writable(key)?;
        Ok(self.values.remove(key))
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.push(FRAME_KEY.to_string());
        keys.push(TITLE_KEY.to_string());
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_and_title_are_read_only() {
        let mut world = World::new("Arena");
        world.advance_frame();
        world.advance_frame();

        assert_eq!(world.get("frame"), Some(HostValue::Integer(2)));
        assert_eq!(world.get("title"), Some(HostValue::from("Arena")));
        assert_eq!(
            world.set("frame", HostValue::Integer(0)),
            Err(HostError::ReadOnly("frame".to_string()))
        );
        assert!(world.remove("title").is_err());
        assert_eq!(world.frame(), 2);
    }

    #[test]
    fn test_keys_include_owned_keys() {
        let mut world = World::new("Arena");
        world.set("score", HostValue::Integer(5)).unwrap();
        world.set("alpha", HostValue::Bool(true)).unwrap();
        assert_eq!(world.keys(), vec!["alpha", "frame", "score", "title"]);

        world.set("score", HostValue::Nil).unwrap();
        assert!(world.get("score").is_none());
    }
}
