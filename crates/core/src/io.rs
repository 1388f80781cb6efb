//! The raster abstraction the engine consumes.
//!
//! The core never reads or writes raster file formats itself; it works
//! against `RasterSource`/`RasterSink`. `MemoryRaster` backs the in-memory
//! mode and the tests; `FileRaster` is the flat binary scratch grid the
//! tiled drivers use for intermediates (fill labels, local accumulation)
//! so they need not fit in RAM.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use ndarray::{s, Array2, ArrayView2};

use crate::crs::Crs;
use crate::error::{Error, Result};
use crate::raster::{GeoTransform, Raster, RasterElement};

/// Read access to a raster, window by window.
///
/// `x`/`y` are column/row of the window origin. Implementations must be
/// shareable across worker threads.
pub trait RasterSource<T: RasterElement>: Send + Sync {
    /// Raster width in cells
    fn width(&self) -> usize;
    /// Raster height in cells
    fn height(&self) -> usize;
    /// The nodata value, if declared
    fn nodata(&self) -> Option<T>;
    /// Affine georeferencing
    fn geotransform(&self) -> GeoTransform;
    /// Coordinate reference system, if known
    fn crs(&self) -> Option<Crs>;
    /// Read a `w`×`h` window with its origin at column `x`, row `y`.
    fn read_window(&self, x: usize, y: usize, w: usize, h: usize) -> Result<Array2<T>>;
}

/// Write access to a raster.
///
/// `write_window` takes `&self`: the sink serializes internally so that
/// workers can write non-overlapping tile interiors concurrently.
pub trait RasterSink<T: RasterElement>: Send + Sync {
    /// Write a window with its origin at column `x`, row `y`.
    fn write_window(&self, x: usize, y: usize, data: ArrayView2<'_, T>) -> Result<()>;
}

/// A raster that is both readable and writable (outputs that a later
/// pass re-reads, and scratch intermediates).
pub trait RasterStore<T: RasterElement>: RasterSource<T> + RasterSink<T> {}

impl<T: RasterElement, S: RasterSource<T> + RasterSink<T>> RasterStore<T> for S {}

fn check_window(x: usize, y: usize, w: usize, h: usize, width: usize, height: usize) -> Result<()> {
    if x + w > width || y + h > height {
        return Err(Error::IndexOutOfBounds {
            row: y + h,
            col: x + w,
            rows: height,
            cols: width,
        });
    }
    Ok(())
}

/// An in-memory raster implementing both source and sink.
#[derive(Debug)]
pub struct MemoryRaster<T: RasterElement> {
    data: RwLock<Array2<T>>,
    transform: GeoTransform,
    crs: Option<Crs>,
    nodata: Option<T>,
}

impl<T: RasterElement> MemoryRaster<T> {
    /// Wrap an existing raster.
    pub fn from_raster(raster: Raster<T>) -> Self {
        let transform = *raster.transform();
        let crs = raster.crs().cloned();
        let nodata = raster.nodata();
        Self {
            data: RwLock::new(raster.into_array()),
            transform,
            crs,
            nodata,
        }
    }

    /// A zeroed raster with the given shape and metadata.
    pub fn zeroed(
        rows: usize,
        cols: usize,
        transform: GeoTransform,
        crs: Option<Crs>,
        nodata: Option<T>,
    ) -> Self {
        Self {
            data: RwLock::new(Array2::zeros((rows, cols))),
            transform,
            crs,
            nodata,
        }
    }

    /// A raster filled with `value`, with the given metadata.
    pub fn filled(
        rows: usize,
        cols: usize,
        value: T,
        transform: GeoTransform,
        crs: Option<Crs>,
        nodata: Option<T>,
    ) -> Self {
        Self {
            data: RwLock::new(Array2::from_elem((rows, cols), value)),
            transform,
            crs,
            nodata,
        }
    }

    /// Consume into a `Raster`.
    pub fn into_raster(self) -> Raster<T> {
        let data = self.data.into_inner().unwrap_or_else(|e| e.into_inner());
        let mut raster = Raster::from_array(data);
        raster.set_transform(self.transform);
        raster.set_crs(self.crs);
        raster.set_nodata(self.nodata);
        raster
    }

    /// Clone the current contents into a `Raster`.
    pub fn snapshot(&self) -> Raster<T> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut raster = Raster::from_array(data);
        raster.set_transform(self.transform);
        raster.set_crs(self.crs.clone());
        raster.set_nodata(self.nodata);
        raster
    }
}

impl<T: RasterElement> RasterSource<T> for MemoryRaster<T> {
    fn width(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).ncols()
    }

    fn height(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).nrows()
    }

    fn nodata(&self) -> Option<T> {
        self.nodata
    }

    fn geotransform(&self) -> GeoTransform {
        self.transform
    }

    fn crs(&self) -> Option<Crs> {
        self.crs.clone()
    }

    fn read_window(&self, x: usize, y: usize, w: usize, h: usize) -> Result<Array2<T>> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        check_window(x, y, w, h, data.ncols(), data.nrows())?;
        Ok(data.slice(s![y..y + h, x..x + w]).to_owned())
    }
}

impl<T: RasterElement> RasterSink<T> for MemoryRaster<T> {
    fn write_window(&self, x: usize, y: usize, window: ArrayView2<'_, T>) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let (h, w) = window.dim();
        check_window(x, y, w, h, data.ncols(), data.nrows())?;
        data.slice_mut(s![y..y + h, x..x + w]).assign(&window);
        Ok(())
    }
}

/// A raster stored as a flat little-endian cell grid in a file.
///
/// Backs the scratch rasters under `working_dir`; no header, the metadata
/// lives in the struct. Positioned reads and writes go through a single
/// file handle guarded by a mutex.
#[derive(Debug)]
pub struct FileRaster<T: RasterElement + bytemuck::Pod> {
    file: Mutex<File>,
    path: PathBuf,
    width: usize,
    height: usize,
    transform: GeoTransform,
    crs: Option<Crs>,
    nodata: Option<T>,
}

impl<T: RasterElement + bytemuck::Pod> FileRaster<T> {
    /// Create a zero-filled grid file of the given shape.
    pub fn create(
        path: impl AsRef<Path>,
        width: usize,
        height: usize,
        transform: GeoTransform,
        crs: Option<Crs>,
        nodata: Option<T>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len((width * height * size_of::<T>()) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            width,
            height,
            transform,
            crs,
            nodata,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill the whole grid with `value`.
    pub fn fill(&self, value: T) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(0))?;
        let row = vec![value; self.width];
        let bytes = bytemuck::cast_slice(&row);
        for _ in 0..self.height {
            file.write_all(bytes)?;
        }
        Ok(())
    }
}

impl<T: RasterElement + bytemuck::Pod> RasterSource<T> for FileRaster<T> {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn nodata(&self) -> Option<T> {
        self.nodata
    }

    fn geotransform(&self) -> GeoTransform {
        self.transform
    }

    fn crs(&self) -> Option<Crs> {
        self.crs.clone()
    }

    fn read_window(&self, x: usize, y: usize, w: usize, h: usize) -> Result<Array2<T>> {
        check_window(x, y, w, h, self.width, self.height)?;
        let cell = size_of::<T>();
        let mut values = Vec::with_capacity(w * h);
        let mut row_bytes = vec![0u8; w * cell];
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        for r in 0..h {
            let offset = (((y + r) * self.width + x) * cell) as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut row_bytes)?;
            values.extend_from_slice(&bytemuck::pod_collect_to_vec::<u8, T>(&row_bytes));
        }
        Array2::from_shape_vec((h, w), values).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl<T: RasterElement + bytemuck::Pod> RasterSink<T> for FileRaster<T> {
    fn write_window(&self, x: usize, y: usize, window: ArrayView2<'_, T>) -> Result<()> {
        let (h, w) = window.dim();
        check_window(x, y, w, h, self.width, self.height)?;
        let cell = size_of::<T>();
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let mut row_buf: Vec<T> = Vec::with_capacity(w);
        for r in 0..h {
            row_buf.clear();
            row_buf.extend(window.row(r).iter().copied());
            let offset = (((y + r) * self.width + x) * cell) as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytemuck::cast_slice(&row_buf))?;
        }
        Ok(())
    }
}
