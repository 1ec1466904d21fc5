//! Repository implementations for SQLite-backed persistence.
//!
//! DocumentRepository, ConversationRepository and MessageRepository operate
//! on the Database struct using raw SQL and publish inserted rows on the
//! shared InsertFeed.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;
use uuid::Uuid;

use docchat_core::error::DocchatError;
use docchat_core::types::{Conversation, Document, Message, NewMessage, Role, RowInserted};

use crate::db::Database;
use crate::feed::InsertFeed;

/// Repository for crawled documents.
pub struct DocumentRepository {
    db: Arc<Database>,
    feed: InsertFeed,
}

impl DocumentRepository {
    pub fn new(db: Arc<Database>, feed: InsertFeed) -> Self {
        Self { db, feed }
    }

    /// Find the document a user already ingested from `url`.
    pub fn find_by_user_and_url(
        &self,
        user_id: Uuid,
        url: &str,
    ) -> Result<Option<Document>, DocchatError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, url, backend_doc_id, created_at
                 FROM documents WHERE user_id = ?1 AND url = ?2 LIMIT 1",
                rusqlite::params![user_id.to_string(), url],
                |row| Ok(row_to_document(row)),
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    /// Return the user's document for `url`, inserting it if missing.
    ///
    /// The boolean is true when a new row was created.
    pub fn find_or_create(
        &self,
        user_id: Uuid,
        url: &str,
    ) -> Result<(Document, bool), DocchatError> {
        let (doc, created) = self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, user_id, url, backend_doc_id, created_at
                     FROM documents WHERE user_id = ?1 AND url = ?2 LIMIT 1",
                    rusqlite::params![user_id.to_string(), url],
                    |row| Ok(row_to_document(row)),
                )
                .optional()
                .map_err(storage_err)?
                .transpose()?;

            if let Some(doc) = existing {
                return Ok((doc, false));
            }

            let doc = Document {
                id: Uuid::new_v4(),
                user_id,
                url: url.to_string(),
                backend_doc_id: None,
                created_at: now_millis(),
            };
            conn.execute(
                "INSERT INTO documents (id, user_id, url, backend_doc_id, created_at)
                 VALUES (?1, ?2, ?3, NULL, ?4)",
                rusqlite::params![
                    doc.id.to_string(),
                    doc.user_id.to_string(),
                    doc.url,
                    doc.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| DocchatError::Storage(format!("Failed to save document: {}", e)))?;
            Ok((doc, true))
        })?;

        if created {
            debug!(document_id = %doc.id, url = %doc.url, "Document created");
            self.feed.publish(RowInserted::Documents(doc.clone()));
        }
        Ok((doc, created))
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Document>, DocchatError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, url, backend_doc_id, created_at
                 FROM documents WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| Ok(row_to_document(row)),
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    /// Record the identifier the indexing backend assigned to a document.
    pub fn attach_backend_id(
        &self,
        id: Uuid,
        backend_doc_id: &str,
    ) -> Result<Document, DocchatError> {
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE documents SET backend_doc_id = ?2 WHERE id = ?1",
                rusqlite::params![id.to_string(), backend_doc_id],
            )
            .map_err(|e| DocchatError::Storage(format!("Failed to update document: {}", e)))
        })?;
        if updated == 0 {
            return Err(DocchatError::NotFound(format!("document {}", id)));
        }
        self.get(id)?
            .ok_or_else(|| DocchatError::NotFound(format!("document {}", id)))
    }
}

/// Repository for conversations.
pub struct ConversationRepository {
    db: Arc<Database>,
    feed: InsertFeed,
}

impl ConversationRepository {
    pub fn new(db: Arc<Database>, feed: InsertFeed) -> Self {
        Self { db, feed }
    }

    /// Start a conversation over an existing document.
    pub fn create(&self, document_id: Uuid, user_id: Uuid) -> Result<Conversation, DocchatError> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            document_id,
            user_id,
            created_at: now_millis(),
        };

        self.db.with_conn(|conn| {
            let doc_exists = conn
                .query_row(
                    "SELECT 1 FROM documents WHERE id = ?1",
                    rusqlite::params![document_id.to_string()],
                    |_| Ok(()),
                )
                .optional()
                .map_err(storage_err)?
                .is_some();
            if !doc_exists {
                return Err(DocchatError::NotFound(format!("document {}", document_id)));
            }

            conn.execute(
                "INSERT INTO conversations (id, document_id, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    conversation.id.to_string(),
                    document_id.to_string(),
                    user_id.to_string(),
                    conversation.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| DocchatError::Storage(format!("Failed to save conversation: {}", e)))?;
            Ok(())
        })?;

        debug!(conversation_id = %conversation.id, %document_id, "Conversation created");
        self.feed
            .publish(RowInserted::Conversations(conversation.clone()));
        Ok(conversation)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Conversation>, DocchatError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, document_id, user_id, created_at FROM conversations WHERE id = ?1",
                rusqlite::params![id.to_string()],
                |row| Ok(row_to_conversation(row)),
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    /// Fetch a conversation only if it belongs to `user_id`.
    pub fn get_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Conversation>, DocchatError> {
        Ok(self.get(id)?.filter(|c| c.user_id == user_id))
    }

    /// A user's conversations, newest first.
    pub fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>, DocchatError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, document_id, user_id, created_at
                     FROM conversations
                     WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC",
                )
                .map_err(storage_err)?;

            let rows = stmt
                .query_map(rusqlite::params![user_id.to_string()], |row| {
                    Ok(row_to_conversation(row))
                })
                .map_err(storage_err)?;

            let mut conversations = Vec::new();
            for row in rows {
                conversations.push(row.map_err(storage_err)??);
            }
            Ok(conversations)
        })
    }
}

/// Repository for conversation messages.
pub struct MessageRepository {
    db: Arc<Database>,
    feed: InsertFeed,
}

impl MessageRepository {
    pub fn new(db: Arc<Database>, feed: InsertFeed) -> Self {
        Self { db, feed }
    }

    /// Append a message to an existing conversation.
    pub fn append(&self, new: &NewMessage) -> Result<Message, DocchatError> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            role: new.role,
            content: new.content.clone(),
            created_at: now_millis(),
        };

        self.db.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    rusqlite::params![new.conversation_id.to_string()],
                    |_| Ok(()),
                )
                .optional()
                .map_err(storage_err)?
                .is_some();
            if !exists {
                return Err(DocchatError::NotFound(format!(
                    "conversation {}",
                    new.conversation_id
                )));
            }

            conn.execute(
                "INSERT INTO conversation_messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.role.as_str(),
                    message.content,
                    message.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| DocchatError::Storage(format!("Failed to save message: {}", e)))?;
            Ok(())
        })?;

        self.feed
            .publish(RowInserted::ConversationMessages(message.clone()));
        Ok(message)
    }

    /// Messages of a conversation, oldest first.
    pub fn list_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, DocchatError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, role, content, created_at
                     FROM conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                )
                .map_err(storage_err)?;

            let rows = stmt
                .query_map(rusqlite::params![conversation_id.to_string()], |row| {
                    Ok(row_to_message(row))
                })
                .map_err(storage_err)?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.map_err(storage_err)??);
            }
            Ok(messages)
        })
    }

    pub fn count_for_conversation(&self, conversation_id: Uuid) -> Result<u64, DocchatError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
                    rusqlite::params![conversation_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(count as u64)
        })
    }
}

// ============================================================================
// Helper functions for row-to-entity conversion.
// ============================================================================

fn row_to_document(row: &rusqlite::Row<'_>) -> Result<Document, DocchatError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let user_id: String = row.get(1).map_err(storage_err)?;
    let url: String = row.get(2).map_err(storage_err)?;
    let backend_doc_id: Option<String> = row.get(3).map_err(storage_err)?;
    let created_at: i64 = row.get(4).map_err(storage_err)?;

    Ok(Document {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        url,
        backend_doc_id,
        created_at: from_millis(created_at),
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, DocchatError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let document_id: String = row.get(1).map_err(storage_err)?;
    let user_id: String = row.get(2).map_err(storage_err)?;
    let created_at: i64 = row.get(3).map_err(storage_err)?;

    Ok(Conversation {
        id: parse_uuid(&id)?,
        document_id: parse_uuid(&document_id)?,
        user_id: parse_uuid(&user_id)?,
        created_at: from_millis(created_at),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, DocchatError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let conversation_id: String = row.get(1).map_err(storage_err)?;
    let role: String = row.get(2).map_err(storage_err)?;
    let content: String = row.get(3).map_err(storage_err)?;
    let created_at: i64 = row.get(4).map_err(storage_err)?;

    Ok(Message {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: role.parse::<Role>()?,
        content,
        created_at: from_millis(created_at),
    })
}

pub(crate) fn storage_err(e: rusqlite::Error) -> DocchatError {
    DocchatError::Storage(e.to_string())
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DocchatError> {
    Uuid::parse_str(s).map_err(|e| DocchatError::Storage(format!("Invalid UUID: {}", e)))
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Current time truncated to the millisecond precision stored in SQLite.
pub(crate) fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Extension trait for rusqlite to support optional query results.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Repos {
        documents: DocumentRepository,
        conversations: ConversationRepository,
        messages: MessageRepository,
        feed: InsertFeed,
    }

    fn make_repos() -> Repos {
        let db = Arc::new(Database::in_memory().unwrap());
        let feed = InsertFeed::default();
        Repos {
            documents: DocumentRepository::new(Arc::clone(&db), feed.clone()),
            conversations: ConversationRepository::new(Arc::clone(&db), feed.clone()),
            messages: MessageRepository::new(db, feed.clone()),
            feed,
        }
    }

    const URL: &str = "https://api.example.com/docs";

    // ========================================================================
    // DocumentRepository tests
    // ========================================================================

    #[test]
    fn test_find_or_create_inserts_once() {
        let repos = make_repos();
        let user = Uuid::new_v4();

        let (first, created) = repos.documents.find_or_create(user, URL).unwrap();
        assert!(created);
        let (second, created_again) = repos.documents.find_or_create(user, URL).unwrap();
        assert!(!created_again);
        assert_eq!(first, second);
    }

    #[test]
    fn test_same_url_different_users_get_distinct_documents() {
        let repos = make_repos();
        let (a, _) = repos.documents.find_or_create(Uuid::new_v4(), URL).unwrap();
        let (b, _) = repos.documents.find_or_create(Uuid::new_v4(), URL).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_find_by_user_and_url() {
        let repos = make_repos();
        let user = Uuid::new_v4();
        assert!(repos
            .documents
            .find_by_user_and_url(user, URL)
            .unwrap()
            .is_none());

        let (doc, _) = repos.documents.find_or_create(user, URL).unwrap();
        let found = repos
            .documents
            .find_by_user_and_url(user, URL)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, doc.id);
    }

    #[test]
    fn test_attach_backend_id() {
        let repos = make_repos();
        let (doc, _) = repos.documents.find_or_create(Uuid::new_v4(), URL).unwrap();
        assert!(doc.backend_doc_id.is_none());

        let updated = repos.documents.attach_backend_id(doc.id, "doc-42").unwrap();
        assert_eq!(updated.backend_doc_id.as_deref(), Some("doc-42"));
        assert_eq!(updated.chat_doc_id(), "doc-42");
    }

    #[test]
    fn test_attach_backend_id_unknown_document() {
        let repos = make_repos();
        let err = repos
            .documents
            .attach_backend_id(Uuid::new_v4(), "doc-42")
            .unwrap_err();
        assert!(matches!(err, DocchatError::NotFound(_)));
    }

    // ========================================================================
    // ConversationRepository tests
    // ========================================================================

    #[test]
    fn test_create_and_get_conversation() {
        let repos = make_repos();
        let user = Uuid::new_v4();
        let (doc, _) = repos.documents.find_or_create(user, URL).unwrap();

        let conv = repos.conversations.create(doc.id, user).unwrap();
        let found = repos.conversations.get(conv.id).unwrap().unwrap();
        assert_eq!(found, conv);
        assert_eq!(found.document_id, doc.id);
    }

    #[test]
    fn test_create_conversation_requires_document() {
        let repos = make_repos();
        let err = repos
            .conversations
            .create(Uuid::new_v4(), Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, DocchatError::NotFound(_)));
    }

    #[test]
    fn test_get_for_user_hides_other_users_conversations() {
        let repos = make_repos();
        let owner = Uuid::new_v4();
        let (doc, _) = repos.documents.find_or_create(owner, URL).unwrap();
        let conv = repos.conversations.create(doc.id, owner).unwrap();

        assert!(repos
            .conversations
            .get_for_user(conv.id, owner)
            .unwrap()
            .is_some());
        assert!(repos
            .conversations
            .get_for_user(conv.id, Uuid::new_v4())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_for_user_newest_first() {
        let repos = make_repos();
        let user = Uuid::new_v4();
        let (doc, _) = repos.documents.find_or_create(user, URL).unwrap();

        let first = repos.conversations.create(doc.id, user).unwrap();
        let second = repos.conversations.create(doc.id, user).unwrap();
        let third = repos.conversations.create(doc.id, user).unwrap();

        let listed: Vec<Uuid> = repos
            .conversations
            .list_for_user(user)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, vec![third.id, second.id, first.id]);
        assert!(repos
            .conversations
            .list_for_user(Uuid::new_v4())
            .unwrap()
            .is_empty());
    }

    // ========================================================================
    // MessageRepository tests
    // ========================================================================

    #[test]
    fn test_messages_are_listed_in_insertion_order() {
        let repos = make_repos();
        let user = Uuid::new_v4();
        let (doc, _) = repos.documents.find_or_create(user, URL).unwrap();
        let conv = repos.conversations.create(doc.id, user).unwrap();

        repos
            .messages
            .append(&NewMessage::user(conv.id, "How do I authenticate?"))
            .unwrap();
        repos
            .messages
            .append(&NewMessage::assistant(conv.id, "Use a bearer token."))
            .unwrap();
        repos
            .messages
            .append(&NewMessage::user(conv.id, "Thanks"))
            .unwrap();

        let messages = repos.messages.list_for_conversation(conv.id).unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["How do I authenticate?", "Use a bearer token.", "Thanks"]
        );
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(repos.messages.count_for_conversation(conv.id).unwrap(), 3);
    }

    #[test]
    fn test_append_to_missing_conversation_fails() {
        let repos = make_repos();
        let err = repos
            .messages
            .append(&NewMessage::user(Uuid::new_v4(), "hello"))
            .unwrap_err();
        assert!(matches!(err, DocchatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_inserts_are_published_on_feed() {
        let repos = make_repos();
        let mut rx = repos.feed.subscribe();
        let user = Uuid::new_v4();

        let (doc, _) = repos.documents.find_or_create(user, URL).unwrap();
        // A lookup hit publishes nothing.
        repos.documents.find_or_create(user, URL).unwrap();
        let conv = repos.conversations.create(doc.id, user).unwrap();
        let msg = repos
            .messages
            .append(&NewMessage::user(conv.id, "hi"))
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), RowInserted::Documents(doc));
        assert_eq!(rx.recv().await.unwrap(), RowInserted::Conversations(conv));
        assert_eq!(
            rx.recv().await.unwrap(),
            RowInserted::ConversationMessages(msg)
        );
        assert!(rx.try_recv().is_err());
    }
}
