//! Field Codec
//!
//! Encodes `(code, value)` inputs onto a request and decodes response cells
//! by `(code, row)`. Failures are reported per field; aggregating them is
//! the caller's job.

use crate::application::ports::SharedTransport;
use crate::domain::{DecodedRow, FieldCode, FieldList, FieldResponse, RequestId, SessionError};

/// Field-level encoder/decoder over the terminal transport.
#[derive(Clone)]
pub struct FieldCodec {
    transport: SharedTransport,
}

impl std::fmt::Debug for FieldCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCodec").finish_non_exhaustive()
    }
}

impl FieldCodec {
    /// Create a codec bound to a transport.
    #[must_use]
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }

    /// Register one field input on a request.
    ///
    /// # Errors
    ///
    /// Returns `EncodeRejected` naming the field if the terminal refuses it.
    pub fn encode_field(
        &self,
        request_id: RequestId,
        code: &FieldCode,
        value: &str,
    ) -> Result<(), SessionError> {
        if self.transport.set_field_input(request_id, code, value) {
            tracing::trace!(%request_id, %code, value, "Field encoded");
            Ok(())
        } else {
            tracing::warn!(%request_id, %code, value, "Field input rejected");
            Err(SessionError::EncodeRejected {
                request_id,
                code: code.clone(),
                value: value.to_string(),
            })
        }
    }

    /// Read one response cell.
    ///
    /// # Errors
    ///
    /// Returns `DecodeOutOfRange` if `row` is past the row count or the code
    /// was not returned. Never substitutes a default.
    pub fn decode_field(
        &self,
        response: &FieldResponse,
        code: &FieldCode,
        row: usize,
    ) -> Result<String, SessionError> {
        let out_of_range = || SessionError::DecodeOutOfRange {
            request_id: response.request_id,
            code: code.clone(),
            row,
            row_count: response.row_count,
        };

        if row >= response.row_count {
            return Err(out_of_range());
        }

        self.transport
            .field_value(response.request_id, code, row)
            .ok_or_else(out_of_range)
    }

    /// Decode every listed field of one row, in list order.
    ///
    /// # Errors
    ///
    /// Returns the first `DecodeOutOfRange` encountered.
    pub fn decode_row(
        &self,
        response: &FieldResponse,
        fields: &FieldList,
        row: usize,
    ) -> Result<DecodedRow, SessionError> {
        let values = fields
            .codes()
            .iter()
            .map(|code| Ok((code.clone(), self.decode_field(response, code, row)?)))
            .collect::<Result<Vec<_>, SessionError>>()?;

        Ok(DecodedRow { index: row, values })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::MockTerminalTransport;
    use crate::domain::FailureKind;

    fn code(raw: &str) -> FieldCode {
        FieldCode::new(raw).unwrap()
    }

    #[test]
    fn encode_reports_the_rejected_field() {
        let mut transport = MockTerminalTransport::new();
        transport
            .expect_set_field_input()
            .returning(|_, code, _| code.as_str() != "9002");
        let codec = FieldCodec::new(Arc::new(transport));
        let id = RequestId::new(5);

        assert!(codec.encode_field(id, &code("9001"), "FX").is_ok());

        let err = codec.encode_field(id, &code("9002"), "X").unwrap_err();
        assert_eq!(
            err,
            SessionError::EncodeRejected {
                request_id: id,
                code: code("9002"),
                value: "X".to_string(),
            }
        );
    }

    #[test]
    fn decode_rejects_row_past_count_without_calling_transport() {
        let mut transport = MockTerminalTransport::new();
        transport.expect_field_value().never();
        let codec = FieldCodec::new(Arc::new(transport));
        let response = FieldResponse {
            request_id: RequestId::new(1),
            row_count: 2,
        };

        let err = codec.decode_field(&response, &code("8"), 2).unwrap_err();
        assert_eq!(err.kind(), FailureKind::DecodeOutOfRange);
    }

    #[test]
    fn decode_rejects_missing_code() {
        let mut transport = MockTerminalTransport::new();
        transport
            .expect_field_value()
            .with(eq(RequestId::new(1)), eq(code("404")), eq(0))
            .returning(|_, _, _| None);
        let codec = FieldCodec::new(Arc::new(transport));
        let response = FieldResponse {
            request_id: RequestId::new(1),
            row_count: 1,
        };

        let err = codec.decode_field(&response, &code("404"), 0).unwrap_err();
        assert_eq!(err.kind(), FailureKind::DecodeOutOfRange);
    }

    #[test]
    fn decode_row_keeps_list_order() {
        let mut transport = MockTerminalTransport::new();
        transport
            .expect_field_value()
            .returning(|_, code, row| Some(format!("{code}@{row}")));
        let codec = FieldCodec::new(Arc::new(transport));
        let response = FieldResponse {
            request_id: RequestId::new(9),
            row_count: 3,
        };
        let fields: FieldList = "9,8".parse().unwrap();

        let row = codec.decode_row(&response, &fields, 1).unwrap();
        assert_eq!(row.index, 1);
        assert_eq!(
            row.values,
            vec![
                (code("9"), "9@1".to_string()),
                (code("8"), "8@1".to_string())
            ]
        );
    }
}
