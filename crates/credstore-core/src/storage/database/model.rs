//! In-process model of the credential database
//!
//! Groups of entries, like a KeePass database. Credentials live in a single
//! reserved group; each entry is titled with its service name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credential::Credentials;
use crate::crypto::SecretString;

/// Name of the group holding every credential
pub const ROOT_GROUP_NAME: &str = "credstore";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    pub groups: Vec<Group>,
}

impl Database {
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|group| group.name == name)
    }

    /// Get a group, creating it if missing
    pub fn group_or_create(&mut self, name: &str) -> &mut Group {
        if let Some(index) = self.groups.iter().position(|group| group.name == name) {
            return &mut self.groups[index];
        }
        self.groups.push(Group::new(name));
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    fn position(&self, title: &str, user_name: Option<&str>) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.matches(title, user_name))
    }

    /// First entry with `title`, restricted to `user_name` when given
    pub fn find(&self, title: &str, user_name: Option<&str>) -> Option<&Entry> {
        self.position(title, user_name).map(|index| &self.entries[index])
    }

    pub fn find_mut(&mut self, title: &str, user_name: Option<&str>) -> Option<&mut Entry> {
        let index = self.position(title, user_name)?;
        Some(&mut self.entries[index])
    }

    pub fn remove(&mut self, title: &str, user_name: Option<&str>) -> Option<Entry> {
        let index = self.position(title, user_name)?;
        Some(self.entries.remove(index))
    }

    /// Append a new empty entry and return it
    pub fn add(&mut self, title: &str) -> &mut Entry {
        self.entries.push(Entry::new(title));
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn find_or_add(&mut self, title: &str, user_name: Option<&str>) -> &mut Entry {
        match self.position(title, user_name) {
            Some(index) => &mut self.entries[index],
            None => self.add(title),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub uuid: Uuid,
    pub title: String,
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretString>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(title: &str) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            title: title.to_string(),
            user_name: None,
            password: None,
            created_at: now,
            modified_at: now,
        }
    }

    fn matches(&self, title: &str, user_name: Option<&str>) -> bool {
        self.title == title
            && user_name.map_or(true, |name| self.user_name.as_deref() == Some(name))
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Credentials view; an entry without a user name answers with its title
    pub fn to_credentials(&self) -> Credentials {
        Credentials {
            user_name: Some(self.user_name.clone().unwrap_or_else(|| self.title.clone())),
            password: self.password.clone(),
        }
    }
}
