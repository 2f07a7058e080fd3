use jiff::Timestamp;
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};
use uuid::Uuid;

use crate::serialize::frame::{FrameReader, FrameWriter};
use crate::{
    ColumnDescriptor, ColumnModel, ColumnType, DescriptorId, FieldDescriptor, FieldStructure,
    INVALID_DESCRIPTOR_ID, NTupleDescriptor, NTupleVersion,
};

/// The decoded content of a header frame, not yet checked for schema consistency.
pub(crate) struct HeaderContents {
    pub name: String,
    pub description: String,
    pub author: String,
    pub custodian: String,
    pub time_stamp_data: Timestamp,
    pub time_stamp_written: Timestamp,
    pub version: NTupleVersion,
    pub own_uuid: Uuid,
    pub group_uuid: Uuid,
    pub fields: Vec<FieldDescriptor>,
    pub columns: Vec<ColumnDescriptor>,
}

impl NTupleDescriptor {
    /// Serialize the identity, fields and columns of the ntuple.
    ///
    /// Returns the size of the header. Without a buffer only the size is computed, so that
    /// callers can allocate exactly once and call again with the buffer.
    pub fn serialize_header(&self, buffer: Option<&mut [u8]>) -> NTupleResult<usize> {
        let size = write_header(self, &mut FrameWriter::counting())?;
        if let Some(buffer) = buffer {
            write_header(self, &mut FrameWriter::new(buffer))?;
        }
        Ok(size)
    }

    /// Serialize the header into a freshly allocated buffer.
    pub fn header_bytes(&self) -> NTupleResult<Vec<u8>> {
        let mut buffer = vec![0u8; self.serialize_header(None)?];
        self.serialize_header(Some(&mut buffer))?;
        Ok(buffer)
    }
}

fn write_header(desc: &NTupleDescriptor, w: &mut FrameWriter<'_>) -> NTupleResult<usize> {
    let start = w.begin_frame()?;
    w.write_string(&desc.name)?;
    w.write_string(&desc.description)?;
    w.write_string(&desc.author)?;
    w.write_string(&desc.custodian)?;
    w.write_i64(desc.time_stamp_data.as_microsecond())?;
    w.write_i64(desc.time_stamp_written.as_microsecond())?;
    w.write_version(desc.version)?;
    w.write_uuid(&desc.own_uuid)?;
    w.write_uuid(&desc.group_uuid)?;

    w.write_len(desc.fields.len(), "field")?;
    for field in desc.fields.values() {
        write_field(field, w)?;
    }
    w.write_len(desc.columns.len(), "column")?;
    for column in desc.columns.values() {
        write_column(column, w)?;
    }
    w.end_frame_with_checksum(start, "header")?;
    Ok(w.position() - start)
}

fn write_field(field: &FieldDescriptor, w: &mut FrameWriter<'_>) -> NTupleResult<()> {
    let start = w.begin_frame()?;
    w.write_u64(field.id)?;
    w.write_version(field.field_version)?;
    w.write_version(field.type_version)?;
    w.write_string(&field.name)?;
    w.write_string(&field.description)?;
    w.write_string(&field.type_name)?;
    w.write_u64(field.n_repetitions)?;
    w.write_u16(field.structure.into())?;
    w.write_u64(field.parent_id.unwrap_or(INVALID_DESCRIPTOR_ID))?;
    w.write_len(field.link_ids.len(), "field link")?;
    for link in &field.link_ids {
        w.write_u64(*link)?;
    }
    w.end_frame(start, "field")
}

fn write_column(column: &ColumnDescriptor, w: &mut FrameWriter<'_>) -> NTupleResult<()> {
    let start = w.begin_frame()?;
    w.write_u64(column.id)?;
    w.write_version(column.version)?;
    w.write_u16(column.model.column_type().into())?;
    w.write_u8(u8::from(column.model.is_sorted()))?;
    w.write_u64(column.field_id)?;
    w.write_u32(column.index)?;
    w.end_frame(start, "column")
}

pub(crate) fn read_header(bytes: &[u8]) -> NTupleResult<HeaderContents> {
    let mut outer = FrameReader::new(bytes, "header");
    let frame = outer.frame("header")?;
    // the header size recorded in the postscript must be the size of the frame
    outer.finish()?;
    let mut r = frame.verify_checksum()?;

    let name = r.read_string()?;
    let description = r.read_string()?;
    let author = r.read_string()?;
    let custodian = r.read_string()?;
    let time_stamp_data = read_timestamp(&mut r)?;
    let time_stamp_written = read_timestamp(&mut r)?;
    let version = r.read_version()?;
    let own_uuid = r.read_uuid()?;
    let group_uuid = r.read_uuid()?;

    let n_fields = r.read_len()?;
    let fields = (0..n_fields)
        .map(|_| read_field(&mut r))
        .collect::<NTupleResult<Vec<_>>>()?;
    let n_columns = r.read_len()?;
    let columns = (0..n_columns)
        .map(|_| read_column(&mut r))
        .collect::<NTupleResult<Vec<_>>>()?;
    r.finish()?;

    Ok(HeaderContents {
        name,
        description,
        author,
        custodian,
        time_stamp_data,
        time_stamp_written,
        version,
        own_uuid,
        group_uuid,
        fields,
        columns,
    })
}

fn read_timestamp(r: &mut FrameReader<'_>) -> NTupleResult<Timestamp> {
    let micros = r.read_i64()?;
    Timestamp::from_microsecond(micros)
        .map_err(|e| ntuple_err!(Format: "header frame holds an invalid timestamp {micros}: {e}"))
}

fn read_field(parent: &mut FrameReader<'_>) -> NTupleResult<FieldDescriptor> {
    let frame = parent.frame("field")?;
    let mut r = frame.reader();
    let id = r.read_u64()?;
    let field = read_field_body(&mut r, id).map_err(|e| e.with_context(format!("field {id}")))?;
    r.finish()?;
    Ok(field)
}

fn read_field_body(r: &mut FrameReader<'_>, id: DescriptorId) -> NTupleResult<FieldDescriptor> {
    let field_version = r.read_version()?;
    let type_version = r.read_version()?;
    let name = r.read_string()?;
    let description = r.read_string()?;
    let type_name = r.read_string()?;
    let n_repetitions = r.read_u64()?;
    let structure = FieldStructure::try_from(r.read_u16()?)?;
    let parent_id = match r.read_u64()? {
        INVALID_DESCRIPTOR_ID => None,
        parent_id => Some(parent_id),
    };
    let n_links = r.read_len()?;
    let link_ids = (0..n_links)
        .map(|_| r.read_u64())
        .collect::<NTupleResult<Vec<_>>>()?;
    Ok(FieldDescriptor {
        id,
        field_version,
        type_version,
        name,
        description,
        type_name,
        n_repetitions,
        structure,
        parent_id,
        link_ids,
    })
}

fn read_column(parent: &mut FrameReader<'_>) -> NTupleResult<ColumnDescriptor> {
    let frame = parent.frame("column")?;
    let mut r = frame.reader();
    let id = r.read_u64()?;
    let column = read_column_body(&mut r, id).map_err(|e| e.with_context(format!("column {id}")))?;
    r.finish()?;
    Ok(column)
}

fn read_column_body(r: &mut FrameReader<'_>, id: DescriptorId) -> NTupleResult<ColumnDescriptor> {
    let version = r.read_version()?;
    let column_type = ColumnType::try_from(r.read_u16()?)?;
    let is_sorted = match r.read_u8()? {
        0 => false,
        1 => true,
        other => ntuple_bail!(Format: "column frame has invalid sorted flag {other}"),
    };
    let field_id = r.read_u64()?;
    let index = r.read_u32()?;
    Ok(ColumnDescriptor {
        id,
        version,
        model: ColumnModel::new(column_type, is_sorted),
        field_id,
        index,
    })
}
