//! LibXML2 and libxslt FFI wrapper
//!
//! Grammar validation and precompiled-transform execution both go through direct FFI
//! calls into the system libxml2 and libxslt libraries.
//!
//! ## Thread Safety Strategy
//!
//! - **Schema parsing and stylesheet compilation** are NOT thread-safe in libxml2 and
//!   libxslt. Both are serialized by a single process-wide lock.
//! - **Validation and transformation** run fully in parallel. Each call creates its own
//!   validation or transform context; compiled schemas and stylesheets are shared
//!   read-only behind `Arc`.
//! - **Error collection** uses libxml2's per-thread structured error handler, so each
//!   blocking task sees only its own diagnostics.
//!
//! ## External references
//!
//! A process-wide external entity loader is installed on initialization. While a
//! [`ResourceChain`] is active on the current thread (see [`with_resource_chain`]),
//! every system identifier libxml2 asks for is resolved through it; identifiers the
//! chain cannot satisfy are recorded and reported as unresolved. Without an active
//! chain the loader defers to libxml2's default behaviour.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, Once, OnceLock};

use libc::{c_char, c_int, c_uint, c_void};
use tracing::debug;

use crate::error::{LibXml2Error, LibXml2Result};
use crate::resolver::ResourceChain;

/// Global initialization flag for libxml2
///
/// libxml2's initialization functions are NOT thread-safe, so they run exactly once.
static LIBXML2_INIT: Once = Once::new();

/// Serializes schema parsing and stylesheet compilation
static COMPILE_LOCK: Mutex<()> = Mutex::new(());

/// libxml2's own loader, used for every identifier once it has been resolved
static DEFAULT_LOADER: OnceLock<XmlExternalEntityLoader> = OnceLock::new();

thread_local! {
    static ACTIVE_CHAIN: RefCell<Option<ResourceChain>> = const { RefCell::new(None) };
    static UNRESOLVED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

// Opaque libxml2 / libxslt structures
#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserInput {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XsltStylesheet {
    _private: [u8; 0],
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    /// Column number, when known
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc =
    Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

pub type XmlExternalEntityLoader = Option<
    unsafe extern "C" fn(
        url: *const c_char,
        id: *const c_char,
        context: *mut XmlParserCtxt,
    ) -> *mut XmlParserInput,
>;

pub type XmlFreeFunc = Option<unsafe extern "C" fn(mem: *mut c_void)>;

// External libxml2 FFI declarations
#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub static xmlFree: XmlFreeFunc;

    pub fn xmlInitParser();

    pub fn xmlGetExternalEntityLoader() -> XmlExternalEntityLoader;
    pub fn xmlSetExternalEntityLoader(loader: XmlExternalEntityLoader);
    pub fn xmlSetStructuredErrorFunc(ctx: *mut c_void, handler: XmlStructuredErrorFunc);

    pub fn xmlReadMemory(
        buffer: *const c_char,
        size: c_int,
        url: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    pub fn xmlFreeDoc(doc: *mut XmlDoc);

    // Schema parsing functions
    pub fn xmlSchemaNewParserCtxt(url: *const c_char) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaParse(ctxt: *const XmlSchemaParserCtxt) -> *mut XmlSchema;
    pub fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    pub fn xmlSchemaFree(schema: *mut XmlSchema);

    // Schema validation functions
    pub fn xmlSchemaNewValidCtxt(schema: *const XmlSchema) -> *mut XmlSchemaValidCtxt;
    pub fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    pub fn xmlSchemaValidateFile(
        ctxt: *const XmlSchemaValidCtxt,
        file_name: *const c_char,
        options: c_uint,
    ) -> c_int;
    pub fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
}

// External libxslt FFI declarations
#[cfg_attr(target_os = "windows", link(name = "libxslt"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xslt"))]
unsafe extern "C" {
    pub fn xsltParseStylesheetFile(filename: *const c_char) -> *mut XsltStylesheet;
    pub fn xsltFreeStylesheet(style: *mut XsltStylesheet);
    pub fn xsltApplyStylesheet(
        style: *mut XsltStylesheet,
        doc: *mut XmlDoc,
        params: *const *const c_char,
    ) -> *mut XmlDoc;
    pub fn xsltSaveResultToString(
        doc_txt_ptr: *mut *mut u8,
        doc_txt_len: *mut c_int,
        result: *mut XmlDoc,
        style: *mut XsltStylesheet,
    ) -> c_int;
}

/// Severity libxml2 attaches to a reported problem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    Warning,
    Error,
    Fatal,
}

impl ErrorLevel {
    fn from_raw(level: c_int) -> Self {
        match level {
            1 => ErrorLevel::Warning,
            3 => ErrorLevel::Fatal,
            _ => ErrorLevel::Error,
        }
    }
}

/// One problem reported by libxml2, with its source position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredError {
    pub level: ErrorLevel,
    pub message: String,
    /// 1-based line; 0 when unknown
    pub line: usize,
    /// 1-based column; 0 when unknown
    pub column: usize,
}

/// Callback for libxml2 to report problems (structured)
unsafe extern "C" fn structured_error_callback(user_data: *mut c_void, error: *mut xmlError) {
    if user_data.is_null() || error.is_null() {
        return;
    }
    let errors = unsafe { &mut *(user_data as *mut Vec<StructuredError>) };
    let error = unsafe { &*error };

    let message = if error.message.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(error.message) }
            .to_string_lossy()
            .trim()
            .to_string()
    };
    errors.push(StructuredError {
        level: ErrorLevel::from_raw(error.level),
        message,
        line: usize::try_from(error.line).unwrap_or(0),
        column: usize::try_from(error.int2).unwrap_or(0),
    });
}

/// Entity loader consulting the thread's active [`ResourceChain`]
unsafe extern "C" fn chain_entity_loader(
    url: *const c_char,
    id: *const c_char,
    context: *mut XmlParserCtxt,
) -> *mut XmlParserInput {
    let Some(default_loader) = DEFAULT_LOADER.get().copied().flatten() else {
        return ptr::null_mut();
    };
    if url.is_null() {
        return unsafe { default_loader(url, id, context) };
    }

    let system_id = unsafe { CStr::from_ptr(url) }
        .to_string_lossy()
        .into_owned();
    let resolution = ACTIVE_CHAIN.with(|slot| {
        slot.try_borrow()
            .ok()
            .and_then(|chain| chain.as_ref().map(|chain| chain.resolve(&system_id)))
    });

    match resolution {
        // No chain installed: libxml2 decides
        None => unsafe { default_loader(url, id, context) },
        Some(Some(path)) => match CString::new(path.to_string_lossy().as_bytes()) {
            Ok(resolved) => unsafe { default_loader(resolved.as_ptr(), id, context) },
            Err(_) => ptr::null_mut(),
        },
        Some(None) => {
            debug!("Unresolved reference {}", system_id);
            UNRESOLVED.with(|unresolved| {
                if let Ok(mut unresolved) = unresolved.try_borrow_mut() {
                    unresolved.push(system_id);
                }
            });
            ptr::null_mut()
        }
    }
}

/// Run `f` with `chain` resolving every external reference libxml2 loads on this thread
///
/// Returns the result of `f` and the system identifiers the chain could not resolve.
pub fn with_resource_chain<R>(chain: &ResourceChain, f: impl FnOnce() -> R) -> (R, Vec<String>) {
    ACTIVE_CHAIN.with(|slot| *slot.borrow_mut() = Some(chain.clone()));
    UNRESOLVED.with(|unresolved| unresolved.borrow_mut().clear());

    let result = f();

    ACTIVE_CHAIN.with(|slot| *slot.borrow_mut() = None);
    let unresolved = UNRESOLVED.with(|unresolved| std::mem::take(&mut *unresolved.borrow_mut()));
    (result, unresolved)
}

fn path_to_cstring(path: &Path) -> LibXml2Result<CString> {
    path.to_str()
        .and_then(|s| CString::new(s).ok())
        .ok_or_else(|| LibXml2Error::InvalidPath {
            path: path.to_path_buf(),
        })
}

fn join_messages(errors: &[StructuredError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Thread-safe wrapper for libxml2 schema pointer with proper resource management
#[derive(Debug)]
pub struct XmlSchemaPtr {
    inner: Arc<XmlSchemaInner>,
}

#[derive(Debug)]
struct XmlSchemaInner {
    ptr: *mut XmlSchema,
    _phantom: PhantomData<XmlSchema>,
}

// Safety: libxml2 documentation states that xmlSchema structures are thread-safe for reading
// See: http://xmlsoft.org/threads.html
unsafe impl Send for XmlSchemaInner {}
unsafe impl Sync for XmlSchemaInner {}

impl XmlSchemaPtr {
    /// # Safety
    ///
    /// The pointer must come from `xmlSchemaParse` and must not be freed elsewhere.
    pub(crate) unsafe fn from_raw(ptr: *mut XmlSchema) -> LibXml2Result<Self> {
        if ptr.is_null() {
            return Err(LibXml2Error::SchemaParseFailed {
                details: "null schema".to_string(),
            });
        }

        Ok(XmlSchemaPtr {
            inner: Arc::new(XmlSchemaInner {
                ptr,
                _phantom: PhantomData,
            }),
        })
    }

    pub(crate) fn as_ptr(&self) -> *const XmlSchema {
        self.inner.ptr
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.ptr.is_null()
    }
}

impl Clone for XmlSchemaPtr {
    fn clone(&self) -> Self {
        XmlSchemaPtr {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for XmlSchemaInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                xmlSchemaFree(self.ptr);
            }
            self.ptr = ptr::null_mut();
        }
    }
}

/// Compiled XSLT stylesheet, shareable across threads
#[derive(Debug, Clone)]
pub struct XsltStylesheetPtr {
    inner: Arc<XsltStylesheetInner>,
}

#[derive(Debug)]
struct XsltStylesheetInner {
    ptr: *mut XsltStylesheet,
}

// Safety: a compiled stylesheet is only read while transforming; each transformation
// allocates its own transform context
unsafe impl Send for XsltStylesheetInner {}
unsafe impl Sync for XsltStylesheetInner {}

impl Drop for XsltStylesheetInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                xsltFreeStylesheet(self.ptr);
            }
            self.ptr = ptr::null_mut();
        }
    }
}

/// Owned libxml2 document, freed on drop
struct OwnedDoc(*mut XmlDoc);

impl Drop for OwnedDoc {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { xmlFreeDoc(self.0) }
        }
    }
}

/// Validation result from libxml2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Validation succeeded (return code 0); warnings may still be present
    Valid { messages: Vec<StructuredError> },
    /// Validation failed with errors (return code > 0)
    Invalid {
        error_count: i32,
        messages: Vec<StructuredError>,
    },
    /// Internal error occurred (return code < 0)
    InternalError { code: i32 },
}

impl ValidationResult {
    pub fn from_code(code: c_int, messages: Vec<StructuredError>) -> Self {
        match code {
            0 => ValidationResult::Valid { messages },
            n if n > 0 => ValidationResult::Invalid {
                error_count: n,
                messages,
            },
            n => ValidationResult::InternalError { code: n },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationResult::Invalid { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationResult::InternalError { .. })
    }

    pub fn messages(&self) -> &[StructuredError] {
        match self {
            ValidationResult::Valid { messages } | ValidationResult::Invalid { messages, .. } => {
                messages
            }
            ValidationResult::InternalError { .. } => &[],
        }
    }
}

/// Safe entry point to libxml2 and libxslt
pub struct LibXml2Wrapper {
    _phantom: PhantomData<()>,
}

impl LibXml2Wrapper {
    /// Initializes libxml2 and installs the chain-aware entity loader, once per process
    pub fn new() -> Self {
        LIBXML2_INIT.call_once(|| unsafe {
            xmlInitParser();
            let _ = DEFAULT_LOADER.set(xmlGetExternalEntityLoader());
            xmlSetExternalEntityLoader(Some(chain_entity_loader));
        });

        LibXml2Wrapper {
            _phantom: PhantomData,
        }
    }

    /// Compile the schema at `location` (a path or URL), resolving imports through `chain`
    pub fn parse_schema(
        &self,
        location: &str,
        chain: &ResourceChain,
    ) -> LibXml2Result<XmlSchemaPtr> {
        let c_location = CString::new(location).map_err(|_| LibXml2Error::InvalidPath {
            path: location.into(),
        })?;
        let _guard = COMPILE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut errors: Vec<StructuredError> = Vec::new();
        let (schema_ptr, unresolved) = with_resource_chain(chain, || unsafe {
            let parser_ctxt = xmlSchemaNewParserCtxt(c_location.as_ptr());
            if parser_ctxt.is_null() {
                return ptr::null_mut();
            }
            let errors_ptr = &mut errors as *mut Vec<StructuredError> as *mut c_void;
            xmlSchemaSetParserStructuredErrors(
                parser_ctxt,
                Some(structured_error_callback),
                errors_ptr,
            );
            xmlSetStructuredErrorFunc(errors_ptr, Some(structured_error_callback));

            let schema_ptr = xmlSchemaParse(parser_ctxt);

            xmlSetStructuredErrorFunc(ptr::null_mut(), None);
            xmlSchemaFreeParserCtxt(parser_ctxt);
            schema_ptr
        });

        if let Some(system_id) = unresolved.into_iter().next() {
            if !schema_ptr.is_null() {
                unsafe { xmlSchemaFree(schema_ptr) };
            }
            return Err(LibXml2Error::UnresolvedReference { system_id });
        }
        if schema_ptr.is_null() {
            return Err(LibXml2Error::SchemaParseFailed {
                details: join_messages(&errors),
            });
        }
        unsafe { XmlSchemaPtr::from_raw(schema_ptr) }
    }

    /// Validate an XML file against a schema
    ///
    /// Safe to call concurrently: each call creates its own validation context and the
    /// streaming parser reports the line and column of every problem.
    pub fn validate_file(
        &self,
        schema: &XmlSchemaPtr,
        file_path: &Path,
    ) -> LibXml2Result<ValidationResult> {
        let c_path = path_to_cstring(file_path)?;

        unsafe {
            let valid_ctxt = xmlSchemaNewValidCtxt(schema.as_ptr());
            if valid_ctxt.is_null() {
                return Err(LibXml2Error::ValidationContextCreationFailed);
            }

            let mut errors: Vec<StructuredError> = Vec::new();
            let errors_ptr = &mut errors as *mut Vec<StructuredError> as *mut c_void;
            xmlSchemaSetValidStructuredErrors(
                valid_ctxt,
                Some(structured_error_callback),
                errors_ptr,
            );
            // well-formedness errors of the streamed input arrive on the thread handler
            xmlSetStructuredErrorFunc(errors_ptr, Some(structured_error_callback));

            let result_code = xmlSchemaValidateFile(valid_ctxt, c_path.as_ptr(), 0);

            xmlSetStructuredErrorFunc(ptr::null_mut(), None);
            xmlSchemaFreeValidCtxt(valid_ctxt);

            let result = ValidationResult::from_code(result_code, errors);
            if let ValidationResult::InternalError { code } = result {
                return Err(LibXml2Error::ValidationFailed {
                    code,
                    file: file_path.to_path_buf(),
                });
            }
            Ok(result)
        }
    }

    /// Compile an XSLT stylesheet, resolving includes and imports through `chain`
    pub fn compile_stylesheet(
        &self,
        path: &Path,
        chain: &ResourceChain,
    ) -> LibXml2Result<XsltStylesheetPtr> {
        let c_path = path_to_cstring(path)?;
        let _guard = COMPILE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut errors: Vec<StructuredError> = Vec::new();
        let (style_ptr, unresolved) = with_resource_chain(chain, || unsafe {
            let errors_ptr = &mut errors as *mut Vec<StructuredError> as *mut c_void;
            xmlSetStructuredErrorFunc(errors_ptr, Some(structured_error_callback));
            let style_ptr = xsltParseStylesheetFile(c_path.as_ptr());
            xmlSetStructuredErrorFunc(ptr::null_mut(), None);
            style_ptr
        });

        if let Some(system_id) = unresolved.into_iter().next() {
            if !style_ptr.is_null() {
                unsafe { xsltFreeStylesheet(style_ptr) };
            }
            return Err(LibXml2Error::UnresolvedReference { system_id });
        }
        if style_ptr.is_null() {
            debug!(
                "Stylesheet {} failed to compile: {}",
                path.display(),
                join_messages(&errors)
            );
            return Err(LibXml2Error::StylesheetParseFailed {
                file: path.to_path_buf(),
            });
        }
        Ok(XsltStylesheetPtr {
            inner: Arc::new(XsltStylesheetInner { ptr: style_ptr }),
        })
    }

    /// Apply a compiled stylesheet to an in-memory document and serialize the result
    ///
    /// `chain`, when given, resolves `document()` calls made during the transformation.
    pub fn transform(
        &self,
        stylesheet: &XsltStylesheetPtr,
        input: &[u8],
        chain: Option<&ResourceChain>,
    ) -> LibXml2Result<Vec<u8>> {
        let size = c_int::try_from(input.len()).map_err(|_| LibXml2Error::DocumentParseFailed {
            details: "document too large".to_string(),
        })?;

        let run = || -> LibXml2Result<Vec<u8>> {
            let mut errors: Vec<StructuredError> = Vec::new();
            unsafe {
                let errors_ptr = &mut errors as *mut Vec<StructuredError> as *mut c_void;
                xmlSetStructuredErrorFunc(errors_ptr, Some(structured_error_callback));
                let doc = OwnedDoc(xmlReadMemory(
                    input.as_ptr() as *const c_char,
                    size,
                    ptr::null(),
                    ptr::null(),
                    0,
                ));
                if doc.0.is_null() {
                    xmlSetStructuredErrorFunc(ptr::null_mut(), None);
                    return Err(LibXml2Error::DocumentParseFailed {
                        details: join_messages(&errors),
                    });
                }

                let style = stylesheet.inner.ptr;
                let result = OwnedDoc(xsltApplyStylesheet(style, doc.0, ptr::null()));
                xmlSetStructuredErrorFunc(ptr::null_mut(), None);
                if result.0.is_null() {
                    return Err(LibXml2Error::TransformFailed {
                        details: join_messages(&errors),
                    });
                }

                let mut buffer: *mut u8 = ptr::null_mut();
                let mut length: c_int = 0;
                if xsltSaveResultToString(&mut buffer, &mut length, result.0, style) != 0 {
                    return Err(LibXml2Error::TransformFailed {
                        details: "result serialization failed".to_string(),
                    });
                }
                if buffer.is_null() {
                    return Ok(Vec::new());
                }
                let output =
                    std::slice::from_raw_parts(buffer, usize::try_from(length).unwrap_or(0))
                        .to_vec();
                if let Some(free) = xmlFree {
                    free(buffer as *mut c_void);
                }
                Ok(output)
            }
        };

        match chain {
            Some(chain) => {
                let (result, unresolved) = with_resource_chain(chain, run);
                match unresolved.into_iter().next() {
                    Some(system_id) if result.is_err() => {
                        Err(LibXml2Error::UnresolvedReference { system_id })
                    }
                    _ => result,
                }
            }
            None => run(),
        }
    }
}

impl Default for LibXml2Wrapper {
    fn default() -> Self {
        Self::new()
    }
}
