#![doc = include_str!("../README.md")]

extern crate alloc;

use alloc::fmt;
use core::str::FromStr;

use log::{debug, warn};

/// Comment line after which new managed entries are inserted when the menu has none yet
pub const ENTRIES_MARKER: &str = "### PXEMGR ENTRIES ###";

const BEGIN_PREFIX: &str = "### BEGIN PXEMGR ";
const END_PREFIX: &str = "### END PXEMGR ";
const SENTINEL_SUFFIX: &str = " ###";

/// Identifies a managed entry: a namespace, usually the image kind, and a name
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EntryKey {
    /// Namespace of the entry
    pub namespace: String,

    /// Name of the entry within its namespace
    pub name: String,
}

impl EntryKey {
    /// Creates a new key
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    fn begin_line(&self) -> String {
        format!("{BEGIN_PREFIX}{self}{SENTINEL_SUFFIX}")
    }

    fn end_line(&self) -> String {
        format!("{END_PREFIX}{self}{SENTINEL_SUFFIX}")
    }

    fn from_sentinel(line: &str, prefix: &str) -> Option<Self> {
        line.trim()
            .strip_prefix(prefix)?
            .strip_suffix(SENTINEL_SUFFIX)?
            .parse()
            .ok()
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl FromStr for EntryKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once(':')
            .ok_or_else(|| format!("Entry key {s} has no namespace"))?;

        if namespace.is_empty() || name.is_empty() {
            return Err(format!("Invalid entry key {s}"));
        }

        Ok(Self::new(namespace, name))
    }
}

/// A GRUB `menuentry` block
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MenuEntry {
    /// Displayed title
    pub title: String,

    /// Stable identifier, used by `default=` and to detect duplicates
    pub id: Option<String>,

    /// `--class` arguments, used by themes to pick an icon
    pub classes: Vec<String>,

    /// Commands in the body, as (command, arguments)
    pub commands: Vec<(String, String)>,
}

impl MenuEntry {
    /// Creates an entry without any command
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_owned(),
            id: None,
            classes: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Sets the entry identifier
    #[must_use]
    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_owned());
        self
    }

    /// Adds a class to the entry
    #[must_use]
    pub fn class(mut self, class: &str) -> Self {
        self.classes.push(class.to_owned());
        self
    }

    /// Appends a command to the entry body
    #[must_use]
    pub fn command(mut self, cmd: &str, args: &str) -> Self {
        self.commands.push((cmd.to_owned(), args.to_owned()));
        self
    }
}

fn escape_title(title: &str) -> String {
    title.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for MenuEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "menuentry \"{}\"", escape_title(&self.title))?;

        for class in &self.classes {
            write!(f, " --class {class}")?;
        }

        if let Some(id) = &self.id {
            write!(f, " --id {id}")?;
        }

        writeln!(f, " {{")?;

        for (cmd, args) in &self.commands {
            if args.is_empty() {
                writeln!(f, "    {cmd}")?;
            } else {
                writeln!(f, "    {cmd} {args}")?;
            }
        }

        writeln!(f, "}}")
    }
}

/// A block of the menu owned by us, sentinels excluded
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagedEntry {
    /// Key found in the sentinels
    pub key: EntryKey,

    /// Lines between the sentinels
    pub body: Vec<String>,

    terminated: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Block {
    Line(String),
    Managed(ManagedEntry),
}

/// A boot menu file
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Menu {
    blocks: Vec<Block>,
}

impl Menu {
    /// Parses the content of a menu file.
    ///
    /// Never fails: a BEGIN sentinel without its END extends up to the next
    /// BEGIN sentinel or the end of the file.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut blocks = Vec::new();
        let mut current: Option<ManagedEntry> = None;

        for line in text.lines() {
            if let Some(key) = EntryKey::from_sentinel(line, BEGIN_PREFIX) {
                if let Some(open) = current.take() {
                    warn!("Menu entry {} isn't terminated", open.key);
                    blocks.push(Block::Managed(open));
                }

                current = Some(ManagedEntry {
                    key,
                    body: Vec::new(),
                    terminated: false,
                });
                continue;
            }

            if let Some(key) = EntryKey::from_sentinel(line, END_PREFIX) {
                match current.take() {
                    Some(mut open) if open.key == key => {
                        open.terminated = true;
                        blocks.push(Block::Managed(open));
                    }
                    Some(open) => {
                        warn!("Menu entry {} closed by sentinel for {key}", open.key);
                        current = Some(open);
                    }
                    None => {
                        debug!("Dropping stray END sentinel for {key}");
                    }
                }
                continue;
            }

            match &mut current {
                Some(open) => open.body.push(line.to_owned()),
                None => blocks.push(Block::Line(line.to_owned())),
            }
        }

        if let Some(open) = current {
            warn!("Menu entry {} runs to the end of the file", open.key);
            blocks.push(Block::Managed(open));
        }

        Self { blocks }
    }

    /// Iterates over the managed entries, in file order
    pub fn entries(&self) -> impl Iterator<Item = &ManagedEntry> {
        self.blocks.iter().filter_map(|b| match b {
            Block::Managed(e) => Some(e),
            Block::Line(_) => None,
        })
    }

    /// Returns whether a managed entry exists for that key
    #[must_use]
    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries().any(|e| &e.key == key)
    }

    /// Returns whether the menu has the ENTRIES marker
    #[must_use]
    pub fn has_marker(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, Block::Line(l) if l.trim() == ENTRIES_MARKER))
    }

    fn insertion_index(&self) -> usize {
        if let Some(idx) = self
            .blocks
            .iter()
            .rposition(|b| matches!(b, Block::Managed(_)))
        {
            return idx + 1;
        }

        if let Some(idx) = self
            .blocks
            .iter()
            .position(|b| matches!(b, Block::Line(l) if l.trim() == ENTRIES_MARKER))
        {
            return idx + 1;
        }

        self.blocks.len()
    }

    /// Adds or replaces the managed entry for that key.
    ///
    /// An existing entry is replaced in place, any duplicate is dropped. A new
    /// entry goes right after the last managed entry, or after the ENTRIES
    /// marker, or at the end of the file.
    pub fn upsert(&mut self, key: &EntryKey, entry: &MenuEntry) {
        let body = entry.to_string().lines().map(str::to_owned).collect();
        let managed = ManagedEntry {
            key: key.clone(),
            body,
            terminated: true,
        };

        if let Some(idx) = self
            .blocks
            .iter()
            .position(|b| matches!(b, Block::Managed(e) if &e.key == key))
        {
            debug!("Replacing menu entry {key}");

            self.blocks[idx] = Block::Managed(managed);

            let mut seen = false;
            self.blocks.retain(|b| match b {
                Block::Managed(e) if &e.key == key => !core::mem::replace(&mut seen, true),
                Block::Managed(_) | Block::Line(_) => true,
            });
            return;
        }

        let idx = self.insertion_index();
        debug!("Inserting menu entry {key} at block {idx}");

        self.blocks.insert(idx, Block::Managed(managed));
    }

    /// Removes every managed entry with that key, returns whether any was found
    pub fn remove(&mut self, key: &EntryKey) -> bool {
        self.retain(|k| k != key) > 0
    }

    /// Keeps only the managed entries for which the predicate holds, returns how many were removed
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&EntryKey) -> bool,
    {
        let before = self.blocks.len();

        self.blocks.retain(|b| match b {
            Block::Managed(e) => keep(&e.key),
            Block::Line(_) => true,
        });

        before - self.blocks.len()
    }

    /// Returns whether any `menuentry` line, managed or not, declares that identifier
    #[must_use]
    pub fn has_entry_id(&self, id: &str) -> bool {
        let lines = self.blocks.iter().flat_map(|b| match b {
            Block::Line(l) => core::slice::from_ref(l),
            Block::Managed(e) => e.body.as_slice(),
        });

        lines
            .filter(|l| l.trim_start().starts_with("menuentry "))
            .any(|l| {
                let mut words = l.split_whitespace();
                words.any(|w| w == "--id" || w == "--id=")
                    && words.next().is_some_and(|w| w.trim_matches('"') == id)
            })
    }

    /// Appends the unmanaged entries whose identifier doesn't appear in the menu yet.
    ///
    /// Returns how many entries were added.
    pub fn ensure_entries(&mut self, entries: &[MenuEntry]) -> usize {
        let mut added = 0;

        for entry in entries {
            let Some(id) = &entry.id else {
                continue;
            };

            if self.has_entry_id(id) {
                continue;
            }

            debug!("Restoring missing menu entry {id}");

            if matches!(self.blocks.last(), Some(Block::Line(l)) if !l.trim().is_empty()) {
                self.blocks.push(Block::Line(String::new()));
            }

            for line in entry.to_string().lines() {
                self.blocks.push(Block::Line(line.to_owned()));
            }

            added += 1;
        }

        added
    }

    /// Appends a raw line to the menu
    pub fn push_line(&mut self, line: &str) {
        self.blocks.push(Block::Line(line.to_owned()));
    }
}

impl fmt::Display for Menu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            match block {
                Block::Line(l) => writeln!(f, "{l}")?,
                Block::Managed(e) => {
                    writeln!(f, "{}", e.key.begin_line())?;

                    for l in &e.body {
                        writeln!(f, "{l}")?;
                    }

                    if e.terminated {
                        writeln!(f, "{}", e.key.end_line())?;
                    }
                }
            }
        }

        Ok(())
    }
}
