//! MongoDB-backed [`DocumentSource`].

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures_util::{StreamExt, TryStreamExt};
use mongodb::options::{
    CollectionOptions, FindOptions, Hint, ReadConcern, ReadPreference, ReadPreferenceOptions,
    SelectionCriteria, TagSet,
};
use mongodb::{Client, Collection};
use parlake_types::error::{Result, SnapshotError};
use parlake_types::options::{ReadConcernLevel, ReadPreferenceMode, SnapshotOptions};

use super::{DocumentSource, DocumentStream, FindSpec};

/// One MongoDB collection with read preference and read concern applied.
pub struct MongoSource {
    collection: Collection<Document>,
}

impl MongoSource {
    /// Connect and bind to the configured collection in `db`, applying the
    /// read options from `options`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Source`] if the client cannot be built.
    pub async fn connect(uri: &str, db: &str, options: &SnapshotOptions) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(SnapshotError::source)?;

        let mut collection_options = CollectionOptions::default();
        if let Some(mode) = options.read_preference {
            collection_options.selection_criteria = Some(SelectionCriteria::ReadPreference(
                read_preference(mode, &options.read_tags),
            ));
        }
        if let Some(level) = options.read_concern {
            collection_options.read_concern = Some(read_concern(level));
        }

        let collection = client
            .database(db)
            .collection_with_options::<Document>(&options.collection, collection_options);
        Ok(Self { collection })
    }

    /// Wrap an existing collection handle.
    #[must_use]
    pub fn from_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }
}

fn read_preference(mode: ReadPreferenceMode, tags: &[(String, String)]) -> ReadPreference {
    let options = if tags.is_empty() {
        None
    } else {
        let set: TagSet = tags.iter().cloned().collect();
        Some(
            ReadPreferenceOptions::builder()
                .tag_sets(vec![set])
                .build(),
        )
    };
    match mode {
        ReadPreferenceMode::Primary => ReadPreference::Primary,
        ReadPreferenceMode::PrimaryPreferred => ReadPreference::PrimaryPreferred { options },
        ReadPreferenceMode::Secondary => ReadPreference::Secondary { options },
        ReadPreferenceMode::SecondaryPreferred => ReadPreference::SecondaryPreferred { options },
        ReadPreferenceMode::Nearest => ReadPreference::Nearest { options },
    }
}

fn read_concern(level: ReadConcernLevel) -> ReadConcern {
    match level {
        ReadConcernLevel::Majority => ReadConcern::majority(),
        ReadConcernLevel::Local => ReadConcern::local(),
        ReadConcernLevel::Linearizable => ReadConcern::linearizable(),
        ReadConcernLevel::Available => ReadConcern::available(),
        ReadConcernLevel::Snapshot => ReadConcern::snapshot(),
    }
}

#[async_trait]
impl DocumentSource for MongoSource {
    async fn find(&self, spec: FindSpec) -> Result<DocumentStream> {
        let direction = if spec.ascending { 1 } else { -1 };
        let mut find_options = FindOptions::default();
        find_options.sort = Some(doc! { "_id": direction });
        find_options.projection = spec.projection;
        find_options.hint = spec.hint.map(Hint::Keys);
        find_options.batch_size = spec.batch_size;
        find_options.limit = spec.limit;
        find_options.no_cursor_timeout = Some(spec.no_cursor_timeout);

        let cursor = self
            .collection
            .find(spec.filter)
            .with_options(find_options)
            .await
            .map_err(SnapshotError::source)?;
        Ok(cursor.map_err(SnapshotError::source).boxed())
    }

    async fn estimated_count(&self) -> Result<u64> {
        self.collection
            .estimated_document_count()
            .await
            .map_err(SnapshotError::source)
    }

    async fn first_id(&self, filter: Document, ascending: bool) -> Result<Option<Bson>> {
        let mut spec = FindSpec::ascending(filter);
        spec.ascending = ascending;
        spec.limit = Some(1);
        spec.projection = Some(doc! { "_id": 1 });
        let mut stream = self.find(spec).await?;
        match stream.next().await {
            Some(first) => Ok(first?.get("_id").cloned()),
            None => Ok(None),
        }
    }
}
