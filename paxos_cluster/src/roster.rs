use crate::{error::RosterError, message::RoleId};
use std::{collections::BTreeMap, fs, path::Path};

// RosterEntry is one line of the roster: the network location of a role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterEntry {
    pub role_id: RoleId,
    pub address: String,
    pub port: u16,
}

/// Roster is the static list of cluster members, keyed by role id. It is read
/// once at startup from lines of the form `roleId,address,port`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    entries: BTreeMap<RoleId, RosterEntry>,
}

impl Roster {
    pub fn load(path: &Path) -> Result<Roster, RosterError> {
        let contents = fs::read_to_string(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Roster::parse(&contents)
    }

    // Parse fails on the first malformed line; there is no partial roster.
    pub fn parse(contents: &str) -> Result<Roster, RosterError> {
        let mut entries = BTreeMap::new();
        for (number, line) in contents.lines().enumerate() {
            let line_number = number + 1;
            if line.trim().is_empty() {
                continue;
            }

            let entry = parse_line(line_number, line)?;
            if entries.contains_key(&entry.role_id) {
                return Err(RosterError::DuplicateRoleId {
                    line: line_number,
                    role_id: entry.role_id,
                });
            }
            entries.insert(entry.role_id, entry);
        }

        Ok(Roster { entries })
    }

    pub fn get(&self, role_id: RoleId) -> Option<&RosterEntry> {
        self.entries.get(&role_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Entries in ascending role id order.
    pub fn entries(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.values()
    }

    // Returns the lowest role id whose address is one of the given local
    // addresses.
    pub fn find_by_address<S: AsRef<str>>(&self, addresses: &[S]) -> Option<RoleId> {
        self.entries
            .values()
            .find(|entry| {
                addresses
                    .iter()
                    .any(|address| address.as_ref() == entry.address)
            })
            .map(|entry| entry.role_id)
    }
}

fn parse_line(line_number: usize, line: &str) -> Result<RosterEntry, RosterError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(RosterError::FieldCount {
            line: line_number,
            found: fields.len(),
        });
    }

    let role_id: RoleId = fields[0].parse().map_err(|_| RosterError::RoleId {
        line: line_number,
        value: fields[0].to_string(),
    })?;
    if role_id == 0 {
        return Err(RosterError::ReservedRoleId { line: line_number });
    }

    let port: u16 = fields[2].parse().map_err(|_| RosterError::Port {
        line: line_number,
        value: fields[2].to_string(),
    })?;

    Ok(RosterEntry {
        role_id,
        address: fields[1].to_string(),
        port,
    })
}
