pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS email (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id INTEGER REFERENCES email(id) ON DELETE SET NULL,
  message_id TEXT NOT NULL,
  subject TEXT NOT NULL,
  in_reply_to TEXT,
  sent_from TEXT NOT NULL,
  date INTEGER NOT NULL,
  body TEXT,
  hidden INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_email_message_id ON email(message_id);
CREATE INDEX IF NOT EXISTS idx_email_parent_id ON email(parent_id);
CREATE INDEX IF NOT EXISTS idx_email_date ON email(date DESC, id ASC);
CREATE INDEX IF NOT EXISTS idx_email_hidden ON email(hidden);

CREATE TABLE IF NOT EXISTS tag (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT,
  seq INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS email_tag (
  email_id INTEGER NOT NULL REFERENCES email(id) ON DELETE CASCADE,
  tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE CASCADE,
  PRIMARY KEY (email_id, tag_id)
);
CREATE INDEX IF NOT EXISTS idx_email_tag_tag ON email_tag(tag_id);

CREATE TABLE IF NOT EXISTS tag_group (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id INTEGER REFERENCES tag_group(id) ON DELETE SET NULL,
  name TEXT NOT NULL UNIQUE,
  description TEXT,
  seq INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tag_group_tag (
  group_id INTEGER NOT NULL REFERENCES tag_group(id) ON DELETE CASCADE,
  tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE CASCADE,
  PRIMARY KEY (group_id, tag_id)
);

CREATE TABLE IF NOT EXISTS mutation (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  description TEXT NOT NULL,
  performed_at INTEGER NOT NULL,
  affected_email_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS mutation_email (
  mutation_id INTEGER NOT NULL REFERENCES mutation(id) ON DELETE CASCADE,
  email_id INTEGER NOT NULL REFERENCES email(id) ON DELETE CASCADE,
  PRIMARY KEY (mutation_id, email_id)
);

CREATE TABLE IF NOT EXISTS email_note (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email_id INTEGER NOT NULL REFERENCES email(id) ON DELETE CASCADE,
  created_at INTEGER NOT NULL,
  message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_email_note_email ON email_note(email_id);
"#;

/// Tables created by [`SCHEMA`], used by integrity checks and tests.
pub(crate) const TABLES: [&str; 8] = [
    "email",
    "tag",
    "email_tag",
    "tag_group",
    "tag_group_tag",
    "mutation",
    "mutation_email",
    "email_note",
];
