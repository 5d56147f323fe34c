//! Operation, response, event, format, and property code tables.
//!
//! Code values follow PIMA 15740 / the MTP specification; the `0x95xx`
//! operations are the Android direct-I/O extensions.

/// Operation codes.
pub mod ops {
    pub const GET_DEVICE_INFO: u16 = 0x1001;
    pub const OPEN_SESSION: u16 = 0x1002;
    pub const CLOSE_SESSION: u16 = 0x1003;
    pub const GET_STORAGE_IDS: u16 = 0x1004;
    pub const GET_STORAGE_INFO: u16 = 0x1005;
    pub const GET_NUM_OBJECTS: u16 = 0x1006;
    pub const GET_OBJECT_HANDLES: u16 = 0x1007;
    pub const GET_OBJECT_INFO: u16 = 0x1008;
    pub const GET_OBJECT: u16 = 0x1009;
    pub const GET_THUMB: u16 = 0x100A;
    pub const DELETE_OBJECT: u16 = 0x100B;
    pub const SEND_OBJECT_INFO: u16 = 0x100C;
    pub const SEND_OBJECT: u16 = 0x100D;
    pub const FORMAT_STORE: u16 = 0x100F;
    pub const RESET_DEVICE: u16 = 0x1010;
    pub const GET_DEVICE_PROP_DESC: u16 = 0x1014;
    pub const GET_DEVICE_PROP_VALUE: u16 = 0x1015;
    pub const SET_DEVICE_PROP_VALUE: u16 = 0x1016;
    pub const MOVE_OBJECT: u16 = 0x1019;
    pub const COPY_OBJECT: u16 = 0x101A;
    pub const GET_PARTIAL_OBJECT: u16 = 0x101B;

    pub const GET_OBJECT_PROPS_SUPPORTED: u16 = 0x9801;
    pub const GET_OBJECT_PROP_DESC: u16 = 0x9802;
    pub const GET_OBJECT_PROP_VALUE: u16 = 0x9803;
    pub const SET_OBJECT_PROP_VALUE: u16 = 0x9804;
    pub const GET_OBJECT_PROP_LIST: u16 = 0x9805;
    pub const GET_OBJECT_REFERENCES: u16 = 0x9810;

    pub const SEND_PARTIAL_OBJECT: u16 = 0x95C1;
    pub const TRUNCATE_OBJECT: u16 = 0x95C2;
    pub const BEGIN_EDIT_OBJECT: u16 = 0x95C3;
    pub const GET_PARTIAL_OBJECT_64: u16 = 0x95C4;
    pub const END_EDIT_OBJECT: u16 = 0x95C5;

    /// Human-readable operation name for logs and diagnostics.
    pub fn name(code: u16) -> &'static str {
        match code {
            GET_DEVICE_INFO => "GetDeviceInfo",
            OPEN_SESSION => "OpenSession",
            CLOSE_SESSION => "CloseSession",
            GET_STORAGE_IDS => "GetStorageIDs",
            GET_STORAGE_INFO => "GetStorageInfo",
            GET_NUM_OBJECTS => "GetNumObjects",
            GET_OBJECT_HANDLES => "GetObjectHandles",
            GET_OBJECT_INFO => "GetObjectInfo",
            GET_OBJECT => "GetObject",
            GET_THUMB => "GetThumb",
            DELETE_OBJECT => "DeleteObject",
            SEND_OBJECT_INFO => "SendObjectInfo",
            SEND_OBJECT => "SendObject",
            FORMAT_STORE => "FormatStore",
            RESET_DEVICE => "ResetDevice",
            GET_DEVICE_PROP_DESC => "GetDevicePropDesc",
            GET_DEVICE_PROP_VALUE => "GetDevicePropValue",
            SET_DEVICE_PROP_VALUE => "SetDevicePropValue",
            MOVE_OBJECT => "MoveObject",
            COPY_OBJECT => "CopyObject",
            GET_PARTIAL_OBJECT => "GetPartialObject",
            GET_OBJECT_PROPS_SUPPORTED => "GetObjectPropsSupported",
            GET_OBJECT_PROP_DESC => "GetObjectPropDesc",
            GET_OBJECT_PROP_VALUE => "GetObjectPropValue",
            SET_OBJECT_PROP_VALUE => "SetObjectPropValue",
            GET_OBJECT_PROP_LIST => "GetObjectPropList",
            GET_OBJECT_REFERENCES => "GetObjectReferences",
            SEND_PARTIAL_OBJECT => "SendPartialObject",
            TRUNCATE_OBJECT => "TruncateObject",
            BEGIN_EDIT_OBJECT => "BeginEditObject",
            GET_PARTIAL_OBJECT_64 => "GetPartialObject64",
            END_EDIT_OBJECT => "EndEditObject",
            _ => "UnknownOperation",
        }
    }
}

/// Response codes.
pub mod rc {
    pub const UNDEFINED: u16 = 0x2000;
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const INVALID_TRANSACTION_ID: u16 = 0x2004;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const PARAMETER_NOT_SUPPORTED: u16 = 0x2006;
    pub const INCOMPLETE_TRANSFER: u16 = 0x2007;
    pub const INVALID_STORAGE_ID: u16 = 0x2008;
    pub const INVALID_OBJECT_HANDLE: u16 = 0x2009;
    pub const DEVICE_PROP_NOT_SUPPORTED: u16 = 0x200A;
    pub const INVALID_OBJECT_FORMAT_CODE: u16 = 0x200B;
    pub const STORE_FULL: u16 = 0x200C;
    pub const OBJECT_WRITE_PROTECTED: u16 = 0x200D;
    pub const STORE_READ_ONLY: u16 = 0x200E;
    pub const ACCESS_DENIED: u16 = 0x200F;
    pub const NO_THUMBNAIL_PRESENT: u16 = 0x2010;
    pub const SELF_TEST_FAILED: u16 = 0x2011;
    pub const PARTIAL_DELETION: u16 = 0x2012;
    pub const STORE_NOT_AVAILABLE: u16 = 0x2013;
    pub const SPECIFICATION_BY_FORMAT_UNSUPPORTED: u16 = 0x2014;
    pub const NO_VALID_OBJECT_INFO: u16 = 0x2015;
    pub const INVALID_CODE_FORMAT: u16 = 0x2016;
    pub const UNKNOWN_VENDOR_CODE: u16 = 0x2017;
    pub const CAPTURE_ALREADY_TERMINATED: u16 = 0x2018;
    pub const DEVICE_BUSY: u16 = 0x2019;
    pub const INVALID_PARENT_OBJECT: u16 = 0x201A;
    pub const INVALID_DEVICE_PROP_FORMAT: u16 = 0x201B;
    pub const INVALID_DEVICE_PROP_VALUE: u16 = 0x201C;
    pub const INVALID_PARAMETER: u16 = 0x201D;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;
    pub const TRANSACTION_CANCELLED: u16 = 0x201F;
    pub const SPECIFICATION_OF_DESTINATION_UNSUPPORTED: u16 = 0x2020;

    pub const INVALID_OBJECT_PROP_CODE: u16 = 0xA801;
    pub const INVALID_OBJECT_PROP_FORMAT: u16 = 0xA802;
    pub const INVALID_OBJECT_PROP_VALUE: u16 = 0xA804;
    pub const INVALID_OBJECT_REFERENCE: u16 = 0xA806;
    pub const OBJECT_TOO_LARGE: u16 = 0xA809;

    /// Human-readable response name for logs and diagnostics.
    pub fn name(code: u16) -> &'static str {
        match code {
            UNDEFINED => "Undefined",
            OK => "OK",
            GENERAL_ERROR => "GeneralError",
            SESSION_NOT_OPEN => "SessionNotOpen",
            INVALID_TRANSACTION_ID => "InvalidTransactionID",
            OPERATION_NOT_SUPPORTED => "OperationNotSupported",
            PARAMETER_NOT_SUPPORTED => "ParameterNotSupported",
            INCOMPLETE_TRANSFER => "IncompleteTransfer",
            INVALID_STORAGE_ID => "InvalidStorageID",
            INVALID_OBJECT_HANDLE => "InvalidObjectHandle",
            DEVICE_PROP_NOT_SUPPORTED => "DevicePropNotSupported",
            INVALID_OBJECT_FORMAT_CODE => "InvalidObjectFormatCode",
            STORE_FULL => "StoreFull",
            OBJECT_WRITE_PROTECTED => "ObjectWriteProtected",
            STORE_READ_ONLY => "StoreReadOnly",
            ACCESS_DENIED => "AccessDenied",
            NO_THUMBNAIL_PRESENT => "NoThumbnailPresent",
            SELF_TEST_FAILED => "SelfTestFailed",
            PARTIAL_DELETION => "PartialDeletion",
            STORE_NOT_AVAILABLE => "StoreNotAvailable",
            SPECIFICATION_BY_FORMAT_UNSUPPORTED => "SpecificationByFormatUnsupported",
            NO_VALID_OBJECT_INFO => "NoValidObjectInfo",
            INVALID_CODE_FORMAT => "InvalidCodeFormat",
            UNKNOWN_VENDOR_CODE => "UnknownVendorCode",
            CAPTURE_ALREADY_TERMINATED => "CaptureAlreadyTerminated",
            DEVICE_BUSY => "DeviceBusy",
            INVALID_PARENT_OBJECT => "InvalidParentObject",
            INVALID_DEVICE_PROP_FORMAT => "InvalidDevicePropFormat",
            INVALID_DEVICE_PROP_VALUE => "InvalidDevicePropValue",
            INVALID_PARAMETER => "InvalidParameter",
            SESSION_ALREADY_OPEN => "SessionAlreadyOpen",
            TRANSACTION_CANCELLED => "TransactionCancelled",
            SPECIFICATION_OF_DESTINATION_UNSUPPORTED => "SpecificationOfDestinationUnsupported",
            INVALID_OBJECT_PROP_CODE => "InvalidObjectPropCode",
            INVALID_OBJECT_PROP_FORMAT => "InvalidObjectPropFormat",
            INVALID_OBJECT_PROP_VALUE => "InvalidObjectPropValue",
            INVALID_OBJECT_REFERENCE => "InvalidObjectReference",
            OBJECT_TOO_LARGE => "ObjectTooLarge",
            _ => "UnknownResponse",
        }
    }
}

/// Event codes.
pub mod evt {
    pub const CANCEL_TRANSACTION: u16 = 0x4001;
    pub const OBJECT_ADDED: u16 = 0x4002;
    pub const OBJECT_REMOVED: u16 = 0x4003;
    pub const STORE_ADDED: u16 = 0x4004;
    pub const STORE_REMOVED: u16 = 0x4005;
    pub const DEVICE_PROP_CHANGED: u16 = 0x4006;
    pub const OBJECT_INFO_CHANGED: u16 = 0x4007;
    pub const DEVICE_INFO_CHANGED: u16 = 0x4008;
    pub const REQUEST_OBJECT_TRANSFER: u16 = 0x4009;
    pub const STORE_FULL: u16 = 0x400A;
    pub const STORAGE_INFO_CHANGED: u16 = 0x400C;
    pub const CAPTURE_COMPLETE: u16 = 0x400D;
    pub const UNREPORTED_STATUS: u16 = 0x400E;

    /// Human-readable event name for logs and diagnostics.
    pub fn name(code: u16) -> &'static str {
        match code {
            CANCEL_TRANSACTION => "CancelTransaction",
            OBJECT_ADDED => "ObjectAdded",
            OBJECT_REMOVED => "ObjectRemoved",
            STORE_ADDED => "StoreAdded",
            STORE_REMOVED => "StoreRemoved",
            DEVICE_PROP_CHANGED => "DevicePropChanged",
            OBJECT_INFO_CHANGED => "ObjectInfoChanged",
            DEVICE_INFO_CHANGED => "DeviceInfoChanged",
            REQUEST_OBJECT_TRANSFER => "RequestObjectTransfer",
            STORE_FULL => "StoreFull",
            STORAGE_INFO_CHANGED => "StorageInfoChanged",
            CAPTURE_COMPLETE => "CaptureComplete",
            UNREPORTED_STATUS => "UnreportedStatus",
            _ => "UnknownEvent",
        }
    }
}

/// Object format codes (the subset this runtime cares about).
pub mod fmt {
    pub const UNDEFINED: u16 = 0x3000;
    /// Folders are "associations" of type GenericFolder.
    pub const ASSOCIATION: u16 = 0x3001;
    pub const TEXT: u16 = 0x3004;
    pub const HTML: u16 = 0x3005;
    pub const WAV: u16 = 0x3008;
    pub const MP3: u16 = 0x3009;
    pub const AVI: u16 = 0x300A;
    pub const MPEG: u16 = 0x300B;
    pub const EXIF_JPEG: u16 = 0x3801;
    pub const BMP: u16 = 0x3804;
    pub const GIF: u16 = 0x3807;
    pub const PNG: u16 = 0x380B;
    pub const WMA: u16 = 0xB901;
    pub const OGG: u16 = 0xB902;
    pub const AAC: u16 = 0xB903;
    pub const MP4: u16 = 0xB982;

    /// The association-type value for a plain folder.
    pub const ASSOC_TYPE_GENERIC_FOLDER: u16 = 0x0001;
}

/// Object and device property codes.
pub mod prop {
    pub const STORAGE_ID: u16 = 0xDC01;
    pub const OBJECT_FORMAT: u16 = 0xDC02;
    pub const PROTECTION_STATUS: u16 = 0xDC03;
    pub const OBJECT_SIZE: u16 = 0xDC04;
    pub const OBJECT_FILE_NAME: u16 = 0xDC07;
    pub const DATE_CREATED: u16 = 0xDC08;
    pub const DATE_MODIFIED: u16 = 0xDC09;
    pub const PARENT_OBJECT: u16 = 0xDC0B;
    pub const PERSISTENT_UID: u16 = 0xDC41;
    pub const NAME: u16 = 0xDC44;

    pub const DEVICE_FRIENDLY_NAME: u16 = 0xD402;

    /// PTP datatype codes used in property values.
    pub mod datatype {
        pub const I8: u16 = 0x0001;
        pub const U8: u16 = 0x0002;
        pub const I16: u16 = 0x0003;
        pub const U16: u16 = 0x0004;
        pub const I32: u16 = 0x0005;
        pub const U32: u16 = 0x0006;
        pub const I64: u16 = 0x0007;
        pub const U64: u16 = 0x0008;
        pub const U128: u16 = 0x000A;
        pub const STRING: u16 = 0xFFFF;
    }
}
