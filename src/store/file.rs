/* This file is part of AnoNet (https://anonet.dev)
 *
 * Copyright (C) 2023-2025 AnoNet developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Tab-separated flat files under the data directory: one line per
//! contact, a two-field line for the identity backup.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::warn;

use super::{Contact, ContactStore, IdentityStore, StoredIdentity};
use crate::{
    crypto::Fingerprint,
    util::file::{load_file, save_file},
    util::time::Timestamp,
    Error, Result,
};

const IDENTITY_FILE: &str = "identity";
const CONTACTS_FILE: &str = "contacts";

pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(base_dir: &PathBuf) -> Self {
        Self { path: base_dir.join(IDENTITY_FILE) }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<StoredIdentity>> {
        if !self.path.exists() {
            return Ok(None)
        }

        let contents = load_file(&self.path)?;
        let line = contents.lines().next().unwrap_or("");
        let (name, mnemonic) = line
            .split_once('\t')
            .ok_or_else(|| Error::Storage("malformed identity backup".to_string()))?;

        Ok(Some(StoredIdentity { name: name.to_string(), mnemonic: mnemonic.to_string() }))
    }

    fn save(&self, identity: &StoredIdentity) -> Result<()> {
        save_file(&self.path, &format!("{}\t{}\n", identity.name, identity.mnemonic))
    }
}

pub struct FileContactStore {
    path: PathBuf,
}

impl FileContactStore {
    pub fn new(base_dir: &PathBuf) -> Self {
        Self { path: base_dir.join(CONTACTS_FILE) }
    }

    fn load_all(&self) -> Result<Vec<Contact>> {
        if !self.path.exists() {
            return Ok(vec![])
        }

        let mut contacts = vec![];
        for line in load_file(&self.path)?.lines() {
            match parse_line(line) {
                Ok(contact) => contacts.push(contact),
                Err(e) => warn!(target: "store::file", "Skipping malformed contact: {e}"),
            }
        }
        Ok(contacts)
    }

    fn save_all(&self, contacts: &[Contact]) -> Result<()> {
        let mut out = String::new();
        for contact in contacts {
            out.push_str(&encode_line(contact));
            out.push('\n');
        }
        save_file(&self.path, &out)
    }
}

impl ContactStore for FileContactStore {
    fn lookup_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Contact>> {
        Ok(self.load_all()?.into_iter().find(|c| c.fingerprint == *fingerprint))
    }

    fn update_last_seen(&self, fingerprint: &Fingerprint, when: Timestamp) -> Result<()> {
        let mut contacts = self.load_all()?;
        for contact in contacts.iter_mut() {
            if contact.fingerprint == *fingerprint {
                contact.last_seen = Some(when);
            }
        }
        self.save_all(&contacts)
    }

    fn upsert(&self, contact: &Contact) -> Result<()> {
        let mut contacts = self.load_all()?;
        match contacts.iter_mut().find(|c| c.fingerprint == contact.fingerprint) {
            Some(existing) => *existing = contact.clone(),
            None => contacts.push(contact.clone()),
        }
        self.save_all(&contacts)
    }

    fn all(&self) -> Result<Vec<Contact>> {
        self.load_all()
    }
}

fn sanitize(field: &str) -> String {
    field.replace(['\t', '\n'], " ")
}

fn encode_line(contact: &Contact) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        sanitize(&contact.display_name),
        sanitize(&contact.username),
        contact.fingerprint,
        BASE64.encode(&contact.public_key_der),
        contact.added_at.inner(),
        contact.last_seen.map(|t| t.inner().to_string()).unwrap_or_default(),
        contact.favorite,
        sanitize(&contact.notes),
    )
}

fn parse_line(line: &str) -> Result<Contact> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 8 {
        return Err(Error::Storage("wrong contact field count".to_string()))
    }

    let storage_err = |what: &str| Error::Storage(format!("bad contact field: {what}"));

    Ok(Contact {
        display_name: fields[0].to_string(),
        username: fields[1].to_string(),
        fingerprint: Fingerprint::from_hex(fields[2]).map_err(|_| storage_err("fingerprint"))?,
        public_key_der: BASE64.decode(fields[3]).map_err(|_| storage_err("public key"))?,
        added_at: Timestamp::from_millis(
            fields[4].parse().map_err(|_| storage_err("added_at"))?,
        ),
        last_seen: if fields[5].is_empty() {
            None
        } else {
            Some(Timestamp::from_millis(
                fields[5].parse().map_err(|_| storage_err("last_seen"))?,
            ))
        },
        favorite: fields[6].parse().map_err(|_| storage_err("favorite"))?,
        notes: fields[7].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(name: &str, fp_byte: u8) -> Contact {
        Contact {
            display_name: name.to_string(),
            username: format!("{name}#00FF00FF"),
            fingerprint: Fingerprint([fp_byte; 32]),
            public_key_der: vec![0x30, 0x59, fp_byte],
            added_at: Timestamp::from_millis(1_700_000_000_000),
            last_seen: None,
            favorite: false,
            notes: "met\tat the\nmeetup".to_string(),
        }
    }

    #[test]
    fn contact_line_roundtrip() {
        let original = contact("dana", 5);
        let parsed = parse_line(&encode_line(&original)).unwrap();

        assert_eq!(parsed.fingerprint, original.fingerprint);
        assert_eq!(parsed.public_key_der, original.public_key_der);
        // Tabs and newlines in notes are flattened.
        assert_eq!(parsed.notes, "met at the meetup");
    }

    #[test]
    fn store_roundtrip_on_disk() {
        let dir = std::env::temp_dir().join(format!("anonet-store-{}", rand::random::<u32>()));
        let store = FileContactStore::new(&dir);

        store.upsert(&contact("erin", 1)).unwrap();
        store.upsert(&contact("frank", 2)).unwrap();

        let found = store.lookup_by_fingerprint(&Fingerprint([2; 32])).unwrap().unwrap();
        assert_eq!(found.display_name, "frank");

        store.update_last_seen(&Fingerprint([1; 32]), Timestamp::from_millis(42)).unwrap();
        let erin = store.lookup_by_fingerprint(&Fingerprint([1; 32])).unwrap().unwrap();
        assert_eq!(erin.last_seen, Some(Timestamp::from_millis(42)));

        assert_eq!(store.all().unwrap().len(), 2);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn identity_backup_roundtrip() {
        let dir = std::env::temp_dir().join(format!("anonet-id-{}", rand::random::<u32>()));
        let store = FileIdentityStore::new(&dir);

        assert!(store.load().unwrap().is_none());

        let identity = StoredIdentity {
            name: "gwen".to_string(),
            mnemonic: "abandon ".repeat(11).trim().to_string() + " about",
        };
        store.save(&identity).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), identity);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
