use uuid::Uuid;

use crate::{ColumnModel, ColumnType, DescriptorId, FieldStructure, NTupleDescriptor, NTupleVersion};

/// Name given to the item field of collections and arrays.
pub const ITEM_FIELD_NAME: &str = "_0";

/// A node of the logical schema: its type, its structure, the columns it is materialized into and
/// its sub fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    type_name: String,
    description: String,
    structure: FieldStructure,
    n_repetitions: u64,
    field_version: NTupleVersion,
    type_version: NTupleVersion,
    columns: Vec<ColumnModel>,
    children: Vec<Field>,
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, structure: FieldStructure) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            description: String::new(),
            structure,
            n_repetitions: 0,
            field_version: NTupleVersion::default(),
            type_version: NTupleVersion::default(),
            columns: Vec::new(),
            children: Vec::new(),
        }
    }

    /// A field stored in a single column of the given type.
    pub fn leaf(name: impl Into<String>, type_name: impl Into<String>, column_type: ColumnType) -> Self {
        Self::new(name, type_name, FieldStructure::Leaf).with_column(column_type.into())
    }

    /// A variable-length collection. The field owns an [`Index`](ColumnType::Index) column with
    /// the cluster-relative end offset of every entry's items; the items are stored by `item`.
    pub fn collection(name: impl Into<String>, type_name: impl Into<String>, item: Field) -> Self {
        Self::new(name, type_name, FieldStructure::Collection)
            .with_column(ColumnType::Index.into())
            .with_child(item.with_name(ITEM_FIELD_NAME))
    }

    pub fn record(name: impl Into<String>, type_name: impl Into<String>, members: impl IntoIterator<Item = Field>) -> Self {
        members
            .into_iter()
            .fold(Self::new(name, type_name, FieldStructure::Record), Field::with_child)
    }

    /// A fixed-size array of `n` items, stored as `n` consecutive elements of the item's columns.
    pub fn array(name: impl Into<String>, type_name: impl Into<String>, item: Field, n: u64) -> Self {
        Self::new(name, type_name, FieldStructure::Leaf)
            .with_n_repetitions(n)
            .with_child(item.with_name(ITEM_FIELD_NAME))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_n_repetitions(mut self, n_repetitions: u64) -> Self {
        self.n_repetitions = n_repetitions;
        self
    }

    pub fn with_field_version(mut self, version: NTupleVersion) -> Self {
        self.field_version = version;
        self
    }

    pub fn with_type_version(mut self, version: NTupleVersion) -> Self {
        self.type_version = version;
        self
    }

    /// Append a column; its index within the field is its position.
    pub fn with_column(mut self, column: ColumnModel) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_child(mut self, child: Field) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn structure(&self) -> FieldStructure {
        self.structure
    }

    pub fn n_repetitions(&self) -> u64 {
        self.n_repetitions
    }

    pub fn field_version(&self) -> NTupleVersion {
        self.field_version
    }

    pub fn type_version(&self) -> NTupleVersion {
        self.type_version
    }

    pub fn columns(&self) -> &[ColumnModel] {
        &self.columns
    }

    pub fn children(&self) -> &[Field] {
        &self.children
    }

    /// Resolve a dot-separated path below this field.
    pub fn find(&self, path: &str) -> Option<&Field> {
        path.split('.').try_fold(self, |field, name| {
            field.children.iter().find(|c| c.name == name)
        })
    }
}

/// The logical schema of an ntuple: the top-level fields of its root record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NTupleModel {
    description: String,
    author: String,
    version: NTupleVersion,
    uuid: Uuid,
    fields: Vec<Field>,
}

impl NTupleModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_version(mut self, version: NTupleVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn version(&self) -> NTupleVersion {
        self.version
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Resolve a dot-separated field path, e.g. `jets._0`.
    pub fn find_field(&self, path: &str) -> Option<&Field> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let top = self.fields.iter().find(|f| f.name == head)?;
        match rest {
            Some(rest) => top.find(rest),
            None => Some(top),
        }
    }
}

impl NTupleDescriptor {
    /// Reconstruct the logical schema from the field tree and the column models.
    ///
    /// Returns an empty model if the descriptor has no root field.
    pub fn generate_model(&self) -> NTupleModel {
        let fields: Vec<Field> = self
            .root_field_id()
            .map(|root| self.field_children(root).map(|f| self.model_field(f.id)).collect())
            .unwrap_or_default();
        NTupleModel {
            description: self.description.clone(),
            author: self.author.clone(),
            version: self.version,
            uuid: self.own_uuid,
            fields,
        }
    }

    fn model_field(&self, field_id: DescriptorId) -> Field {
        let Some(desc) = self.fields.get(&field_id) else {
            return Field::new("", "", FieldStructure::Invalid);
        };
        Field {
            name: desc.name.clone(),
            type_name: desc.type_name.clone(),
            description: desc.description.clone(),
            structure: desc.structure,
            n_repetitions: desc.n_repetitions,
            field_version: desc.field_version,
            type_version: desc.type_version,
            columns: self.field_columns(field_id).iter().map(|c| c.model).collect(),
            children: desc.link_ids.iter().map(|&id| self.model_field(id)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDescriptor, NTupleDescriptorBuilder};

    #[test]
    fn collection_item_is_renamed() {
        let jets = Field::collection(
            "jets",
            "std::vector<float>",
            Field::leaf("item", "float", ColumnType::Real32),
        );
        assert_eq!(jets.columns(), &[ColumnModel::from(ColumnType::Index)]);
        assert_eq!(jets.children()[0].name(), ITEM_FIELD_NAME);
        assert_eq!(jets.find("_0").map(Field::type_name), Some("float"));
    }

    #[test]
    fn find_field_by_path() {
        let model = NTupleModel::new()
            .with_field(Field::leaf("pt", "float", ColumnType::Real32))
            .with_field(Field::record(
                "event",
                "Event",
                [
                    Field::leaf("id", "std::int64_t", ColumnType::Int64),
                    Field::array("pos", "std::array<double,3>", Field::leaf("", "double", ColumnType::Real64), 3),
                ],
            ));
        assert_eq!(model.find_field("pt").map(Field::name), Some("pt"));
        assert_eq!(model.find_field("event.pos._0").map(Field::type_name), Some("double"));
        assert_eq!(model.find_field("event.pos").map(Field::n_repetitions), Some(3));
        assert!(model.find_field("event.missing").is_none());
    }

    #[test]
    fn generate_model_from_fields() {
        let mut builder = NTupleDescriptorBuilder::new();
        builder
            .set_ntuple("ntpl", "a test", "me", NTupleVersion::new(1, 0, 0), Uuid::from_u128(9))
            .unwrap();
        builder
            .add_field(FieldDescriptor::new(0, "", "", FieldStructure::Record))
            .unwrap();
        builder
            .add_field(FieldDescriptor::new(1, "jets", "std::vector<float>", FieldStructure::Collection))
            .unwrap();
        builder
            .add_field(FieldDescriptor::new(2, "_0", "float", FieldStructure::Leaf))
            .unwrap();
        builder.add_field_link(0, 1).unwrap();
        builder.add_field_link(1, 2).unwrap();
        let v = NTupleVersion::default();
        builder.add_column(0, 1, v, ColumnType::Index.into(), 0).unwrap();
        builder.add_column(1, 2, v, ColumnType::Real32.into(), 0).unwrap();

        let model = builder.descriptor().generate_model();
        let expected = NTupleModel::new()
            .with_description("a test")
            .with_author("me")
            .with_version(NTupleVersion::new(1, 0, 0))
            .with_uuid(Uuid::from_u128(9))
            .with_field(Field::collection(
                "jets",
                "std::vector<float>",
                Field::leaf("_0", "float", ColumnType::Real32),
            ));
        assert_eq!(model, expected);
    }

    #[test]
    fn empty_descriptor_has_empty_model() {
        assert!(NTupleDescriptor::default().generate_model().fields().is_empty());
    }
}
