use serde_json::{Map, Number, Value, json};
use thiserror::Error;

pub(crate) struct OrderedCollection(Map<String, Value>);

impl OrderedCollection {
    pub(crate) fn new(id: &str) -> OrderedCollection {
        let mut map = Map::new();
        map.insert(
            "@context".to_string(),
            json!("https://www.w3.org/ns/activitystreams"),
        );
        map.insert("id".to_string(), Value::String(id.to_string()));
        map.insert("type".to_string(), json!("OrderedCollection"));
        OrderedCollection(map)
    }
    pub(crate) fn total_items(mut self, total: usize) -> OrderedCollection {
        self.0
            .insert("totalItems".to_string(), Value::Number(Number::from(total)));
        self
    }
    pub(crate) fn with_ordered_items(mut self, items: Vec<Value>) -> OrderedCollection {
        self.0
            .insert("orderedItems".to_string(), Value::Array(items));
        self
    }
    pub(crate) fn first(self, link: &str) -> OrderedCollection {
        self.link("first", link)
    }
    pub(crate) fn next(self, link: &str) -> OrderedCollection {
        self.link("next", link)
    }
    pub(crate) fn prev(self, link: &str) -> OrderedCollection {
        self.link("prev", link)
    }
    pub(crate) fn part_of(self, link: &str) -> OrderedCollection {
        self.link("partOf", link)
    }
    fn link(mut self, prop: &str, link: &str) -> OrderedCollection {
        self.0
            .insert(prop.to_string(), Value::String(link.to_string()));
        self
    }
    pub(crate) fn to_page(mut self) -> OrderedCollection {
        self.0
            .insert("type".to_string(), json!("OrderedCollectionPage"));
        self
    }
}

impl From<OrderedCollection> for Value {
    fn from(value: OrderedCollection) -> Self {
        Value::Object(value.0)
    }
}

/// Optional parts of a collection representation.
#[derive(Debug, Default)]
pub(crate) struct CollectionParts<'a> {
    pub(crate) items: Option<Vec<Value>>,
    pub(crate) first: Option<&'a str>,
    pub(crate) part_of: Option<&'a str>,
    pub(crate) next: Option<&'a str>,
    pub(crate) prev: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionType {
    OrderedCollection,
    OrderedCollectionPage,
}

/// Builds a collection object. Only the parts that are present are emitted.
pub(crate) fn build_collection(
    id: &str,
    ty: CollectionType,
    total_items: usize,
    parts: CollectionParts<'_>,
) -> Value {
    let mut collection = OrderedCollection::new(id).total_items(total_items);
    if ty == CollectionType::OrderedCollectionPage {
        collection = collection.to_page();
    }
    if let Some(items) = parts.items {
        collection = collection.with_ordered_items(items);
    }
    if let Some(first) = parts.first {
        collection = collection.first(first);
    }
    if let Some(part_of) = parts.part_of {
        collection = collection.part_of(part_of);
    }
    if let Some(next) = parts.next {
        collection = collection.next(next);
    }
    if let Some(prev) = parts.prev {
        collection = collection.prev(prev);
    }
    collection.into()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PageError {
    #[error("page must be a number")]
    NotANumber,
    #[error("page must be at least 1")]
    OutOfRange,
}

/// Parses the `page` query parameter. Pages are 1-indexed.
pub(crate) fn parse_page(raw: &str) -> Result<usize, PageError> {
    let page: i64 = raw.trim().parse().map_err(|_| PageError::NotANumber)?;
    if page < 1 {
        return Err(PageError::OutOfRange);
    }
    usize::try_from(page).map_err(|_| PageError::OutOfRange)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Page<T> {
    pub(crate) items: Vec<T>,
    pub(crate) has_next: bool,
    pub(crate) has_prev: bool,
}

/// Slices one page out of `all`. A page past the end is empty rather than an error.
pub(crate) fn build_page<T: Clone>(all: &[T], page: usize, page_size: usize) -> Page<T> {
    let page = page.max(1);
    let page_size = page_size.max(1);
    let total = all.len();
    let start = (page - 1).saturating_mul(page_size);
    let items = if start >= total {
        vec![]
    } else {
        all[start..total.min(start + page_size)].to_vec()
    };
    Page {
        items,
        has_next: page.saturating_mul(page_size) < total,
        has_prev: page > 1,
    }
}

/// Renders either the collection summary (no page requested) or one of its pages.
pub(crate) fn render_collection(
    collection_id: &str,
    items: Vec<Value>,
    page: Option<usize>,
    page_size: usize,
) -> Value {
    let total = items.len();
    let Some(page) = page else {
        let first = format!("{collection_id}?page=1");
        let parts = CollectionParts {
            first: (total > 0).then_some(first.as_str()),
            ..Default::default()
        };
        return build_collection(
            collection_id,
            CollectionType::OrderedCollection,
            total,
            parts,
        );
    };
    let Page {
        items,
        has_next,
        has_prev,
    } = build_page(&items, page, page_size);
    let id = format!("{collection_id}?page={page}");
    let next = format!("{collection_id}?page={}", page + 1);
    let prev = format!("{collection_id}?page={}", page - 1);
    build_collection(
        &id,
        CollectionType::OrderedCollectionPage,
        total,
        CollectionParts {
            items: Some(items),
            part_of: Some(collection_id),
            next: has_next.then_some(next.as_str()),
            prev: has_prev.then_some(prev.as_str()),
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{
        CollectionParts, CollectionType, PageError, build_collection, build_page, parse_page,
        render_collection,
    };

    #[test]
    fn collection_only_has_defined_fields() {
        let collection = build_collection(
            "https://x/actors/bob/outbox",
            CollectionType::OrderedCollection,
            0,
            CollectionParts::default(),
        );
        assert_eq!(
            collection,
            json!({
                "@context": "https://www.w3.org/ns/activitystreams",
                "id": "https://x/actors/bob/outbox",
                "type": "OrderedCollection",
                "totalItems": 0
            })
        );
    }

    #[test]
    fn pages_reassemble_the_full_list() {
        for total in 0..23usize {
            for page_size in 1..7usize {
                let all: Vec<usize> = (0..total).collect();
                let last_page = total.div_ceil(page_size);
                let mut seen = vec![];
                for page in 1..=last_page {
                    let result = build_page(&all, page, page_size);
                    assert_eq!(result.has_prev, page > 1);
                    assert_eq!(result.has_next, page < last_page);
                    seen.extend(result.items);
                }
                assert_eq!(seen, all);

                let beyond = build_page(&all, last_page + 1, page_size);
                assert!(beyond.items.is_empty());
                assert!(!beyond.has_next);
            }
        }
    }

    #[test]
    fn page_parameter_validation() {
        assert_eq!(parse_page("3"), Ok(3));
        assert_eq!(parse_page("0"), Err(PageError::OutOfRange));
        assert_eq!(parse_page("-2"), Err(PageError::OutOfRange));
        assert_eq!(parse_page("two"), Err(PageError::NotANumber));
        assert_eq!(parse_page(""), Err(PageError::NotANumber));
    }

    #[test]
    fn render_summary_and_pages() {
        let id = "https://x/actors/bob/followers";
        let items: Vec<Value> = (1..=5).map(|i| json!(format!("https://y/u/{i}"))).collect();

        let summary = render_collection(id, items.clone(), None, 2);
        assert_eq!(summary["type"], "OrderedCollection");
        assert_eq!(summary["totalItems"], 5);
        assert_eq!(summary["first"], "https://x/actors/bob/followers?page=1");
        assert!(summary.get("orderedItems").is_none());

        let second = render_collection(id, items.clone(), Some(2), 2);
        assert_eq!(second["type"], "OrderedCollectionPage");
        assert_eq!(second["id"], "https://x/actors/bob/followers?page=2");
        assert_eq!(second["partOf"], id);
        assert_eq!(second["orderedItems"], json!(["https://y/u/3", "https://y/u/4"]));
        assert_eq!(second["next"], "https://x/actors/bob/followers?page=3");
        assert_eq!(second["prev"], "https://x/actors/bob/followers?page=1");

        let last = render_collection(id, items, Some(3), 2);
        assert!(last.get("next").is_none());
    }

    #[test]
    fn empty_collection_has_no_first_page() {
        let summary = render_collection("https://x/c", vec![], None, 20);
        assert_eq!(summary["totalItems"], 0);
        assert!(summary.get("first").is_none());
    }
}
