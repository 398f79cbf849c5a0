//! Address-ordered table of non-overlapping guest regions.
//!
//! Regions are keyed by base address in a [`BTreeMap`], so point and range
//! queries cost `O(log n)` plus the number of regions touched.

use std::collections::BTreeMap;

use log::debug;

use super::{
    is_page_aligned, range_end, GuestAddr, Permissions, Region, RegionInfo, ADDRESS_SPACE_END,
};
use crate::MapError;

/// One piece of a range query, either covered by a region or a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// `[start, end)` is covered by the region based at `base`.
    Mapped {
        /// Inclusive start of this piece.
        start: GuestAddr,
        /// Exclusive end of this piece.
        end: u64,
        /// Base address of the covering region.
        base: GuestAddr,
        /// Access rights of the covering region.
        perms: Permissions,
    },
    /// `[start, end)` is not covered by any region.
    Gap {
        /// Inclusive start of the gap.
        start: GuestAddr,
        /// Exclusive end of the gap.
        end: u64,
    },
}

impl Segment {
    /// Inclusive start of this piece.
    #[must_use]
    pub const fn start(&self) -> GuestAddr {
        match self {
            Self::Mapped { start, .. } | Self::Gap { start, .. } => *start,
        }
    }

    /// Exclusive end of this piece.
    #[must_use]
    pub const fn end(&self) -> u64 {
        match self {
            Self::Mapped { end, .. } | Self::Gap { end, .. } => *end,
        }
    }

    /// Returns `true` for unmapped pieces.
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }
}

// Callers only pass values below `ADDRESS_SPACE_END`.
#[allow(clippy::cast_possible_truncation)]
const fn to_addr(value: u64) -> GuestAddr {
    debug_assert!(value < ADDRESS_SPACE_END);
    value as GuestAddr
}

/// Ordered collection of non-overlapping regions for one address space.
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: BTreeMap<GuestAddr, Region>,
}

impl RegionTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` when nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions.values()
    }

    /// Descriptions of all regions in ascending address order.
    #[must_use]
    pub fn infos(&self) -> Vec<RegionInfo> {
        self.regions().map(Region::info).collect()
    }

    /// Returns the region containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: GuestAddr) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    fn lookup_mut(&mut self, addr: GuestAddr) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Key from which an ordered scan starting at `addr` must begin.
    fn scan_key(&self, addr: GuestAddr) -> GuestAddr {
        self.lookup(addr).map_or(addr, Region::base)
    }

    /// Splits `[address, address + length)` into ordered mapped and gap pieces.
    ///
    /// The range is clipped at the top of the address space. A zero-length
    /// query yields no pieces.
    #[must_use]
    pub fn lookup_range(&self, address: GuestAddr, length: u64) -> Vec<Segment> {
        let end = u64::from(address)
            .saturating_add(length)
            .min(ADDRESS_SPACE_END);
        let mut cursor = u64::from(address);
        let mut segments = Vec::new();

        for region in self.regions.range(self.scan_key(address)..).map(|(_, r)| r) {
            if cursor >= end {
                break;
            }
            let base = u64::from(region.base());
            if base >= end {
                break;
            }
            if base > cursor {
                segments.push(Segment::Gap {
                    start: to_addr(cursor),
                    end: base,
                });
                cursor = base;
            }
            let piece_end = region.end().min(end);
            segments.push(Segment::Mapped {
                start: to_addr(cursor),
                end: piece_end,
                base: region.base(),
                perms: region.perms(),
            });
            cursor = piece_end;
        }

        if cursor < end {
            segments.push(Segment::Gap {
                start: to_addr(cursor),
                end,
            });
        }

        segments
    }

    /// Validates a mutation request and returns its exclusive end.
    fn validate(base: GuestAddr, size: u32) -> Result<u64, MapError> {
        if size == 0 {
            return Err(MapError::EmptyRange { base });
        }
        if !is_page_aligned(base) || !is_page_aligned(size) {
            return Err(MapError::Alignment { base, size });
        }
        range_end(base, u64::from(size)).ok_or(MapError::RangeOverflow {
            base,
            size: u64::from(size),
        })
    }

    /// Fails with the first unmapped address in `[start, start + len)`.
    fn require_coverage(&self, start: GuestAddr, len: u64) -> Result<(), MapError> {
        match self
            .lookup_range(start, len)
            .into_iter()
            .find(Segment::is_gap)
        {
            Some(gap) => Err(MapError::NotMapped {
                address: gap.start(),
            }),
            None => Ok(()),
        }
    }

    /// Splits the region containing `at` so that a region boundary falls on `at`.
    fn split_at(&mut self, at: u64) {
        if at >= ADDRESS_SPACE_END {
            return;
        }
        let at = to_addr(at);
        let Some(region) = self.lookup_mut(at) else {
            return;
        };
        if region.base() == at {
            return;
        }
        let tail = region.split_off(at);
        self.regions.insert(at, tail);
    }

    pub(crate) fn map(
        &mut self,
        base: GuestAddr,
        size: u32,
        perms: Permissions,
    ) -> Result<(), MapError> {
        let end = Self::validate(base, size)?;
        let last = to_addr(end - 1);

        let overlapping = self.lookup(base).or_else(|| {
            self.regions
                .range(base..=last)
                .next()
                .map(|(_, region)| region)
        });
        if let Some(existing) = overlapping {
            return Err(MapError::Overlap {
                base,
                size,
                existing: existing.base(),
            });
        }

        debug!("map {base:#010x}+{size:#x} {perms:?}");
        self.regions.insert(base, Region::new(base, size, perms));
        Ok(())
    }

    pub(crate) fn unmap(&mut self, base: GuestAddr, size: u32) -> Result<(), MapError> {
        let end = Self::validate(base, size)?;
        self.require_coverage(base, u64::from(size))?;

        self.split_at(u64::from(base));
        self.split_at(end);

        let doomed: Vec<GuestAddr> = self
            .regions
            .range(base..=to_addr(end - 1))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            self.regions.remove(&key);
        }

        debug!("unmap {base:#010x}+{size:#x}");
        Ok(())
    }

    pub(crate) fn protect(
        &mut self,
        base: GuestAddr,
        size: u32,
        perms: Permissions,
    ) -> Result<(), MapError> {
        let end = Self::validate(base, size)?;
        self.require_coverage(base, u64::from(size))?;

        self.split_at(u64::from(base));
        self.split_at(end);

        for region in self.regions.range_mut(base..=to_addr(end - 1)).map(|(_, r)| r) {
            region.set_perms(perms);
        }

        debug!("protect {base:#010x}+{size:#x} {perms:?}");
        Ok(())
    }

    fn check_host_range(&self, address: GuestAddr, len: usize) -> Result<(), MapError> {
        let len = len as u64;
        if range_end(address, len).is_none() {
            return Err(MapError::RangeOverflow {
                base: address,
                size: len,
            });
        }
        self.require_coverage(address, len)
    }

    /// Copies guest bytes into `buf`, ignoring permissions.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::NotMapped`] at the first uncovered byte, or
    /// [`MapError::RangeOverflow`] when the range wraps; `buf` is untouched
    /// in both cases.
    pub fn read_bytes(&self, address: GuestAddr, buf: &mut [u8]) -> Result<(), MapError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_host_range(address, buf.len())?;

        let mut cursor = address;
        let mut done = 0;
        for region in self.regions.range(self.scan_key(address)..).map(|(_, r)| r) {
            let offset = region.offset(cursor);
            let count = (region.bytes().len() - offset).min(buf.len() - done);
            buf[done..done + count].copy_from_slice(&region.bytes()[offset..offset + count]);
            done += count;
            if done == buf.len() {
                break;
            }
            cursor = region.base().wrapping_add(region.size());
        }
        Ok(())
    }

    /// Copies `data` into guest memory, ignoring permissions. All or nothing.
    pub(crate) fn write_bytes(&mut self, address: GuestAddr, data: &[u8]) -> Result<(), MapError> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_host_range(address, data.len())?;

        let start = self.scan_key(address);
        let mut cursor = address;
        let mut done = 0;
        for region in self.regions.range_mut(start..).map(|(_, r)| r) {
            let offset = region.offset(cursor);
            let count = (region.bytes().len() - offset).min(data.len() - done);
            region.bytes_mut()[offset..offset + count]
                .copy_from_slice(&data[done..done + count]);
            done += count;
            if done == data.len() {
                break;
            }
            cursor = region.base().wrapping_add(region.size());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{RegionTable, Segment};
    use crate::memory::Permissions;
    use crate::MapError;

    fn table_with(regions: &[(u32, u32, Permissions)]) -> RegionTable {
        let mut table = RegionTable::new();
        for &(base, size, perms) in regions {
            table.map(base, size, perms).expect("fixture regions are valid");
        }
        table
    }

    #[test]
    fn map_rejects_unaligned_empty_and_wrapping_requests() {
        let mut table = RegionTable::new();

        assert_eq!(
            table.map(0x1001, 0x1000, Permissions::ALL),
            Err(MapError::Alignment {
                base: 0x1001,
                size: 0x1000
            })
        );
        assert_eq!(
            table.map(0x1000, 0x800, Permissions::ALL),
            Err(MapError::Alignment {
                base: 0x1000,
                size: 0x800
            })
        );
        assert_eq!(
            table.map(0x1000, 0, Permissions::ALL),
            Err(MapError::EmptyRange { base: 0x1000 })
        );
        assert_eq!(
            table.map(0xffff_f000, 0x2000, Permissions::ALL),
            Err(MapError::RangeOverflow {
                base: 0xffff_f000,
                size: 0x2000
            })
        );
        assert!(table.is_empty());
    }

    #[test]
    fn last_page_of_address_space_can_be_mapped() {
        let mut table = RegionTable::new();
        table.map(0xffff_f000, 0x1000, Permissions::READ).unwrap();
        assert!(table.lookup(u32::MAX).is_some());
    }

    #[test]
    fn map_rejects_overlap_and_leaves_table_unchanged() {
        let mut table = table_with(&[(0x2000, 0x2000, Permissions::READ)]);
        let before = table.infos();

        for (base, size) in [(0x1000, 0x2000), (0x3000, 0x1000), (0x1000, 0x4000)] {
            assert_eq!(
                table.map(base, size, Permissions::ALL),
                Err(MapError::Overlap {
                    base,
                    size,
                    existing: 0x2000
                })
            );
        }

        assert_eq!(table.infos(), before);
        table.map(0x1000, 0x1000, Permissions::ALL).unwrap();
        table.map(0x4000, 0x1000, Permissions::ALL).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn lookup_respects_region_bounds() {
        let table = table_with(&[(0x0040_0000, 0x4000, Permissions::READ)]);

        assert!(table.lookup(0x003f_ffff).is_none());
        assert_eq!(
            table.lookup(0x0040_0000).map(|r| r.perms()),
            Some(Permissions::READ)
        );
        assert!(table.lookup(0x0040_3fff).is_some());
        assert!(table.lookup(0x0040_4000).is_none());
    }

    #[test]
    fn lookup_range_reports_gaps_and_pieces_in_order() {
        let table = table_with(&[
            (0x1000, 0x1000, Permissions::RW),
            (0x2000, 0x1000, Permissions::READ),
            (0x4000, 0x1000, Permissions::ALL),
        ]);

        let segments = table.lookup_range(0x0800, 0x4000);
        assert_eq!(
            segments,
            vec![
                Segment::Gap {
                    start: 0x0800,
                    end: 0x1000
                },
                Segment::Mapped {
                    start: 0x1000,
                    end: 0x2000,
                    base: 0x1000,
                    perms: Permissions::RW
                },
                Segment::Mapped {
                    start: 0x2000,
                    end: 0x3000,
                    base: 0x2000,
                    perms: Permissions::READ
                },
                Segment::Gap {
                    start: 0x3000,
                    end: 0x4000
                },
                Segment::Mapped {
                    start: 0x4000,
                    end: 0x4800,
                    base: 0x4000,
                    perms: Permissions::ALL
                },
            ]
        );
    }

    #[test]
    fn lookup_range_inside_one_region_is_a_single_piece() {
        let table = table_with(&[(0x0040_0000, 0x4000, Permissions::READ)]);
        assert_eq!(
            table.lookup_range(0x0040_0025, 4),
            vec![Segment::Mapped {
                start: 0x0040_0025,
                end: 0x0040_0029,
                base: 0x0040_0000,
                perms: Permissions::READ
            }]
        );
        assert!(table.lookup_range(0x0040_0025, 0).is_empty());
    }

    #[test]
    fn lookup_range_on_empty_table_is_one_gap() {
        let table = RegionTable::new();
        assert_eq!(
            table.lookup_range(0x0050_4ffc, 4),
            vec![Segment::Gap {
                start: 0x0050_4ffc,
                end: 0x0050_5000
            }]
        );
    }

    #[test]
    fn unmap_whole_region_removes_it() {
        let mut table = table_with(&[(0x1000, 0x2000, Permissions::ALL)]);
        table.unmap(0x1000, 0x2000).unwrap();
        assert!(table.is_empty());
        assert!(table.lookup(0x1000).is_none());
    }

    #[test]
    fn unmap_interior_splits_region_and_keeps_contents() {
        let mut table = table_with(&[(0x1000, 0x3000, Permissions::RW)]);
        table.write_bytes(0x1ffe, &[1, 2, 3, 4]).unwrap();
        table.write_bytes(0x3000, &[9]).unwrap();

        table.unmap(0x2000, 0x1000).unwrap();

        let infos = table.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!((infos[0].base, infos[0].size), (0x1000, 0x1000));
        assert_eq!((infos[1].base, infos[1].size), (0x3000, 0x1000));

        let mut head = [0u8; 2];
        table.read_bytes(0x1ffe, &mut head).unwrap();
        assert_eq!(head, [1, 2]);
        let mut tail = [0u8; 1];
        table.read_bytes(0x3000, &mut tail).unwrap();
        assert_eq!(tail, [9]);
        assert_eq!(
            table.read_bytes(0x2000, &mut tail),
            Err(MapError::NotMapped { address: 0x2000 })
        );
    }

    #[test]
    fn unmap_across_adjacent_regions_trims_both() {
        let mut table = table_with(&[
            (0x1000, 0x2000, Permissions::READ),
            (0x3000, 0x2000, Permissions::RW),
        ]);

        table.unmap(0x2000, 0x2000).unwrap();

        let infos = table.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!((infos[0].base, infos[0].size), (0x1000, 0x1000));
        assert_eq!((infos[1].base, infos[1].size), (0x4000, 0x1000));
        assert_eq!(infos[1].perms, Permissions::RW);
    }

    #[test]
    fn unmap_with_gap_fails_without_changes() {
        let mut table = table_with(&[
            (0x1000, 0x1000, Permissions::READ),
            (0x3000, 0x1000, Permissions::READ),
        ]);
        let before = table.infos();

        assert_eq!(
            table.unmap(0x1000, 0x3000),
            Err(MapError::NotMapped { address: 0x2000 })
        );
        assert_eq!(table.infos(), before);
        assert_eq!(
            table.unmap(0x8000, 0x1000),
            Err(MapError::NotMapped { address: 0x8000 })
        );
    }

    #[test]
    fn protect_sub_range_splits_and_changes_only_that_range() {
        let mut table = table_with(&[(0x1000, 0x3000, Permissions::RW)]);

        table.protect(0x2000, 0x1000, Permissions::READ).unwrap();

        let perms: Vec<_> = table.infos().iter().map(|info| info.perms).collect();
        assert_eq!(
            perms,
            vec![Permissions::RW, Permissions::READ, Permissions::RW]
        );
        assert_eq!(
            table.protect(0x4000, 0x1000, Permissions::READ),
            Err(MapError::NotMapped { address: 0x4000 })
        );
    }

    #[test]
    fn host_copies_span_contiguous_regions_and_ignore_permissions() {
        let mut table = table_with(&[
            (0x1000, 0x1000, Permissions::READ),
            (0x2000, 0x1000, Permissions::empty()),
        ]);

        table.write_bytes(0x1ffe, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();

        let mut buf = [0u8; 4];
        table.read_bytes(0x1ffe, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn host_write_into_partial_coverage_writes_nothing() {
        let mut table = table_with(&[(0x1000, 0x1000, Permissions::RW)]);

        assert_eq!(
            table.write_bytes(0x1ffe, &[1, 2, 3, 4]),
            Err(MapError::NotMapped { address: 0x2000 })
        );

        let mut buf = [0xFFu8; 2];
        table.read_bytes(0x1ffe, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }
}
